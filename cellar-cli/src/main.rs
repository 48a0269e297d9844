mod command;
mod output;
mod trace;

use std::io::{stdin, stdout, IsTerminal, Read, Write};
use std::panic;

use anyhow::{bail, Context, Result};
use clap::Parser;
use command::Command;
use log::info;

use cellar_client::config::ClientConfig;
use cellar_client::rpc::RpcClient;
use cellar_core::error::Error;

#[derive(Debug, Parser)]
#[command(version, about = "Talks to a secrets server")]
struct Args {
    /// Configuration file path.
    #[clap(short = 'c', long = "config", default_value = "config/cellar-cli.yaml")]
    config: String,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_hooks();
    install_ctrlc_handler()?;

    let args = Args::parse();

    let log_dir = format!(
        "{}/.cellar-cli",
        std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
    );
    let _guards = trace::init_logging(&log_dir, &args.log_level)?;

    let cfg = ClientConfig::load(&args.config).context("loading client config")?;
    info!("cellar connecting to {}", cfg.server_url());

    let rpc = RpcClient::new(cfg.server_url());

    match args.command {
        Command::Server => check_server(&cfg).await?,
        Command::List => do_list(&rpc).await?,
        Command::Info { name } => do_info(&rpc, &name).await?,
        Command::Get {
            name,
            version,
            if_changed,
        } => do_get(&rpc, &name, version, if_changed).await?,
        Command::Put { name, from_file } => do_put(&rpc, &name, from_file).await?,
        Command::SetActive { name, version } => do_set_active(&rpc, &name, version).await?,
    }

    Ok(())
}

async fn check_server(cfg: &ClientConfig) -> Result<()> {
    let url = format!("{}/healthz", cfg.server_url().trim_end_matches('/'));
    let resp = reqwest::get(&url).await.context("reaching server")?;
    if resp.status().is_success() {
        println!("{} is reachable", cfg.server_url());
        Ok(())
    } else {
        bail!("server responded with {}", resp.status());
    }
}

async fn do_list(rpc: &RpcClient) -> Result<()> {
    let infos = rpc.list().await.map_err(to_anyhow)?;
    output::list(&infos);
    Ok(())
}

async fn do_info(rpc: &RpcClient, name: &str) -> Result<()> {
    let info = rpc.info(name).await.map_err(to_anyhow)?;
    output::info(&info);
    Ok(())
}

async fn do_get(rpc: &RpcClient, name: &str, version: Option<u64>, if_changed: Option<u64>) -> Result<()> {
    let value = if let Some(known_version) = if_changed {
        match rpc.get_if_changed(name, known_version).await {
            Ok(value) => value,
            Err(Error::ValueNotChanged) => return Ok(()),
            Err(err) => return Err(to_anyhow(err)),
        }
    } else if let Some(version) = version {
        rpc.get_version(name, version).await.map_err(to_anyhow)?
    } else {
        rpc.get(name).await.map_err(to_anyhow)?
    };

    stdout().write_all(&value.value).context("writing secret value to stdout")?;
    Ok(())
}

async fn do_put(rpc: &RpcClient, name: &str, from_file: Option<std::path::PathBuf>) -> Result<()> {
    let bytes = match from_file {
        Some(path) => std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?,
        None => {
            if stdin().is_terminal() {
                bail!("refusing to read a secret value from an interactive terminal; pipe it in or pass --from-file");
            }
            let mut buf = Vec::new();
            stdin().read_to_end(&mut buf).context("reading secret value from stdin")?;
            buf
        }
    };

    let spinner = indicatif::ProgressBar::new_spinner();
    spinner.set_style(
        indicatif::ProgressStyle::with_template("{spinner:.green} uploading {msg}")
            .unwrap(),
    );
    spinner.set_message(name.to_string());
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));

    let result = rpc.put(name, bytes).await;
    spinner.finish_and_clear();

    let version = result.map_err(to_anyhow)?;
    println!("{name}: created version {version}");
    Ok(())
}

async fn do_set_active(rpc: &RpcClient, name: &str, version: u64) -> Result<()> {
    rpc.activate(name, version).await.map_err(to_anyhow)?;
    println!("{name}: activated version {version}");
    Ok(())
}

fn to_anyhow(err: Error) -> anyhow::Error {
    anyhow::anyhow!(err.to_string())
}

fn install_ctrlc_handler() -> Result<()> {
    ctrlc::set_handler(|| {
        eprintln!("interrupted");
        std::process::exit(130);
    })
    .context("installing Ctrl-C handler")
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
