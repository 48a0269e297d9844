//! The periodic backup task: samples the store's write generation once a
//! tick, and on change uploads the already-encrypted envelope verbatim.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cellar_core::facade::Database;
use chrono::Utc;

/// The backup object-store contract. Failures are tolerated -- a backup
/// tick that fails is logged and retried next tick, never surfaced to
/// foreground mutations.
pub trait ObjectStore: Send + Sync {
    fn put_object(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> anyhow::Result<()>;
}

/// Runs until `shutdown` resolves. Intended to be spawned as its own
/// tokio task; does not contend with the database facade's lock beyond
/// the read done inside `store_path`'s file read.
pub async fn run(
    db: Arc<Database>,
    store: Arc<dyn ObjectStore>,
    bucket: String,
    store_path: PathBuf,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut last_uploaded_generation: Option<u64> = None;
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        let generation = db.write_generation();
        if last_uploaded_generation == Some(generation) {
            continue;
        }

        match std::fs::read(&store_path) {
            Ok(bytes) => {
                let key = backup_key(Utc::now());
                match store.put_object(&bucket, &key, bytes) {
                    Ok(()) => {
                        last_uploaded_generation = Some(generation);
                        log::info!("uploaded backup {key} (generation {generation})");
                    }
                    Err(err) => {
                        log::warn!("backup upload failed, will retry next tick: {err}");
                    }
                }
            }
            Err(err) => {
                log::warn!("backup read of {store_path:?} failed, will retry next tick: {err}");
            }
        }
    }
}

fn backup_key(now: chrono::DateTime<Utc>) -> String {
    format!(
        "{}/db-{}.json",
        now.format("%Y/%m/%d"),
        now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellar_core::crypto::{DataKey, KeyEncryptionKey};
    use cellar_core::error::CResult;
    use std::sync::Mutex;

    struct LocalKek(DataKey);

    impl KeyEncryptionKey for LocalKek {
        fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> CResult<Vec<u8>> {
            self.0.seal(plaintext, aad)
        }
        fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> CResult<Vec<u8>> {
            self.0.open(ciphertext, aad)
        }
    }

    struct RecordingStore {
        uploads: Mutex<Vec<(String, String)>>,
    }

    impl ObjectStore for RecordingStore {
        fn put_object(&self, bucket: &str, key: &str, _bytes: Vec<u8>) -> anyhow::Result<()> {
            self.uploads
                .lock()
                .unwrap()
                .push((bucket.to_string(), key.to_string()));
            Ok(())
        }
    }

    #[test]
    fn backup_key_is_timestamped_under_date_prefix() {
        let now = chrono::DateTime::parse_from_rfc3339("2024-03-05T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let key = backup_key(now);
        assert!(key.starts_with("2024/03/05/db-"));
        assert!(key.ends_with(".json"));
    }

    #[tokio::test]
    async fn uploads_on_generation_change_and_skips_when_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");

        let kek = LocalKek(DataKey::generate());
        let store = cellar_core::store::Store::open(&path, &kek).unwrap();
        let db = Arc::new(Database::new(
            store,
            Arc::new(cellar_core::audit::MemoryAuditSink::new()),
        ));

        let object_store = Arc::new(RecordingStore {
            uploads: Mutex::new(Vec::new()),
        });

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(run(
            db.clone(),
            object_store.clone(),
            "bucket".to_string(),
            path.clone(),
            Duration::from_millis(20),
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(80)).await;
        task.abort();

        let uploads = object_store.uploads.lock().unwrap();
        assert!(!uploads.is_empty());
        assert!(uploads.iter().all(|(bucket, _)| bucket == "bucket"));
    }
}
