//! Client-side configuration, mirroring the server's: a serde-derived
//! struct with optional fields and defaulting accessors, read through
//! `confy` so a missing file falls back to defaults instead of failing
//! startup.

use std::path::PathBuf;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

const DEFAULT_SERVER_URL: &str = "https://127.0.0.1:8443";
const DEFAULT_MIRROR_PATH: &str = "cellar/mirror.json";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_INIT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the secrets server's JSON API.
    server_url: Option<String>,
    /// Secret names to declare and block on at startup.
    #[serde(default)]
    pub declared: Vec<String>,
    /// Path to the local mirror file; `None` disables mirroring.
    mirror_path: Option<PathBuf>,
    /// Background poll interval, in seconds.
    poll_interval_secs: Option<u64>,
    /// How long `open()` blocks waiting for declared secrets before
    /// giving up, in seconds.
    init_timeout_secs: Option<u64>,
    /// Whether `lookup_secret`/`lookup_watcher` are permitted.
    #[serde(default)]
    pub allow_lookup: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_url: Some(DEFAULT_SERVER_URL.to_string()),
            declared: Vec::new(),
            mirror_path: Some(PathBuf::from(DEFAULT_MIRROR_PATH)),
            poll_interval_secs: Some(DEFAULT_POLL_INTERVAL_SECS),
            init_timeout_secs: Some(DEFAULT_INIT_TIMEOUT_SECS),
            allow_lookup: false,
        }
    }
}

impl ClientConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let cfg: ClientConfig = confy::load_path(path).unwrap_or_default();
        Ok(cfg)
    }

    pub fn server_url(&self) -> &str {
        self.server_url.as_deref().unwrap_or(DEFAULT_SERVER_URL)
    }

    pub fn mirror_path(&self) -> Option<PathBuf> {
        self.mirror_path.clone()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS))
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs.unwrap_or(DEFAULT_INIT_TIMEOUT_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_without_a_file() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.server_url(), DEFAULT_SERVER_URL);
        assert!(cfg.mirror_path().is_some());
        assert_eq!(cfg.poll_interval(), Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS));
    }
}
