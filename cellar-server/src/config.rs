//! Server configuration, loaded the way the CLI loads its own: a
//! serde-derived struct with optional fields and defaulting accessors,
//! read through `confy` so a missing file falls back to defaults instead
//! of failing startup.

use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8443";
const DEFAULT_STORE_PATH: &str = "cellar/db.json";
const DEFAULT_POLICY_PATH: &str = "cellar/policy.json";
const DEFAULT_AUDIT_LOG_PATH: &str = "cellar/audit.jsonl";
const DEFAULT_BACKUP_BUCKET: &str = "cellar-backups";
const DEFAULT_BACKUP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the JSON API listens on.
    bind_addr: Option<String>,
    /// Path to the encrypted database envelope.
    store_path: Option<PathBuf>,
    /// Path to the ACL policy document (permissive JSON).
    policy_path: Option<PathBuf>,
    /// Path to the append-only audit log.
    audit_log_path: Option<PathBuf>,
    /// Object-store bucket the backup task uploads into.
    pub backup_bucket: Option<String>,
    /// Backup sampling interval, in seconds.
    backup_interval_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: Some(DEFAULT_BIND_ADDR.to_string()),
            store_path: Some(PathBuf::from(DEFAULT_STORE_PATH)),
            policy_path: Some(PathBuf::from(DEFAULT_POLICY_PATH)),
            audit_log_path: Some(PathBuf::from(DEFAULT_AUDIT_LOG_PATH)),
            backup_bucket: Some(DEFAULT_BACKUP_BUCKET.to_string()),
            backup_interval_secs: Some(DEFAULT_BACKUP_INTERVAL_SECS),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let cfg: ServerConfig = confy::load_path(path).unwrap_or_default();
        Ok(cfg)
    }

    pub fn bind_addr(&self) -> &str {
        self.bind_addr.as_deref().unwrap_or(DEFAULT_BIND_ADDR)
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH))
    }

    pub fn policy_path(&self) -> PathBuf {
        self.policy_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_POLICY_PATH))
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.audit_log_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_AUDIT_LOG_PATH))
    }

    pub fn backup_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.backup_interval_secs.unwrap_or(DEFAULT_BACKUP_INTERVAL_SECS),
        )
    }
}
