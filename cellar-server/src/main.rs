use std::net::SocketAddr;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use cellar_server::audit_file::FileAuditSink;
use cellar_server::backup::{self, ObjectStore};
use cellar_server::config::ServerConfig;
use cellar_server::identity::{Identity, IdentityOracle};
use cellar_server::{build_router, trace, AppState};

use cellar_core::crypto::{DataKey, KeyEncryptionKey};
use cellar_core::error::CResult;
use cellar_core::facade::Database;
use cellar_core::store::Store;

#[derive(Debug, Parser)]
#[command(version, about = "Runs the secrets server")]
struct Args {
    /// Configuration file path.
    #[clap(short = 'c', long = "config", default_value = "config/cellar-server.yaml")]
    config: String,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,
}

/// Stand-in key-encryption key used until a deployment wires its own
/// external oracle through this same trait. Persists its key material
/// next to the store so that restarting this binary -- unlike a
/// regenerate-on-every-boot stub -- can still unwrap a previously-written
/// envelope.
struct EnvKek(DataKey);

impl EnvKek {
    fn load_or_create(path: &std::path::Path) -> Result<Self> {
        if let Ok(bytes) = std::fs::read(path) {
            return DataKey::from_bytes(&bytes)
                .map(EnvKek)
                .context("stored local KEK material is corrupt");
        }

        let dek = DataKey::generate();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        std::fs::write(path, dek.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(EnvKek(dek))
    }
}

impl KeyEncryptionKey for EnvKek {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> CResult<Vec<u8>> {
        self.0.seal(plaintext, aad)
    }
    fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> CResult<Vec<u8>> {
        self.0.open(ciphertext, aad)
    }
}

/// Stand-in identity oracle: grants every caller the tag `tag:local`. A
/// real deployment supplies its own, derived from whatever network
/// identity system it already trusts.
struct AllowAllIdentityOracle;

impl IdentityOracle for AllowAllIdentityOracle {
    fn resolve(&self, remote_addr: &str) -> CResult<Identity> {
        Ok(Identity {
            node_name: remote_addr.to_string(),
            tags: vec!["tag:local".to_string()],
            user_login: None,
            capability_map: Default::default(),
        })
    }
}

struct NoopObjectStore;

impl ObjectStore for NoopObjectStore {
    fn put_object(&self, _bucket: &str, _key: &str, _bytes: Vec<u8>) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_hooks();

    let args = Args::parse();

    let log_dir = format!(
        "{}/.cellar-server",
        std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
    );
    let _guards = trace::init_logging(&log_dir, &args.log_level)?;

    let cfg = ServerConfig::load(&args.config).context("loading server config")?;
    info!("cellar-server starting with config at {}", args.config);

    let kek = EnvKek::load_or_create(&cfg.store_path().with_extension("kek"))
        .context("loading local KEK stand-in")?;
    let store = Store::open(cfg.store_path(), &kek).context("opening secrets store")?;
    let audit = FileAuditSink::open(cfg.audit_log_path()).context("opening audit log")?;
    let db = Arc::new(Database::new(store, Arc::new(audit)));

    let running = Arc::new(AtomicBool::new(true));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    {
        let running = running.clone();
        let shutdown_tx = shutdown_tx.clone();
        ctrlc::set_handler(move || {
            info!("received Ctrl+C, shutting down");
            running.store(false, Ordering::SeqCst);
            let _ = shutdown_tx.send(true);
        })
        .context("installing Ctrl-C handler")?;
    }

    let backup_task = tokio::spawn(backup::run(
        db.clone(),
        Arc::new(NoopObjectStore),
        cfg.backup_bucket.clone().unwrap_or_default(),
        cfg.store_path(),
        cfg.backup_interval(),
        shutdown_rx,
    ));

    let state = AppState {
        db,
        identity: Arc::new(AllowAllIdentityOracle),
    };
    let app = build_router(state);

    let addr: SocketAddr = cfg.bind_addr().parse().context("parsing bind address")?;
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_tx.subscribe().changed().await;
    })
    .await?;

    let _ = backup_task.await;
    Ok(())
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(':', ", ").into(),
        homepage: env!("CARGO_PKG_HOMEPAGE").into(),
    };

    let default_hook = panic::take_hook();
    if std::env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            default_hook(info);
            let file_path = human_panic::handle_dump(&meta, info);
            let _ = human_panic::print_msg(file_path, &meta);
        }));
    }
}
