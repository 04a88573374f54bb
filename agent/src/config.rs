//! Configuration management for the agent.

use roam_sync::{RetryConfig, SyncConfig};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the remote sync API
    pub remote_url: String,
    /// Device ID stamped on local changes
    pub device_id: String,
    /// Directory holding the local store and the queue snapshot
    pub data_dir: PathBuf,
    /// Time between timer-triggered sync cycles
    pub sync_interval: Duration,
    /// Maximum operations in flight
    pub concurrency: usize,
    /// Deadline for a single remote call
    pub timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let remote_url = lookup("ROAM_REMOTE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::MissingRemoteUrl)?;
        if !remote_url.starts_with("http://") && !remote_url.starts_with("https://") {
            return Err(ConfigError::InvalidRemoteUrl(remote_url));
        }

        let device_id = lookup("ROAM_DEVICE_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let data_dir = lookup("ROAM_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./roam-data"));

        let sync_interval = parse(&lookup, "ROAM_SYNC_INTERVAL_SECS", 60)?;
        let concurrency = parse(&lookup, "ROAM_CONCURRENCY", 10)?;
        let timeout = parse(&lookup, "ROAM_TIMEOUT_SECS", 30)?;

        if sync_interval == 0 {
            return Err(ConfigError::Invalid("ROAM_SYNC_INTERVAL_SECS"));
        }

        Ok(Self {
            remote_url: remote_url.trim_end_matches('/').to_string(),
            device_id,
            data_dir,
            sync_interval: Duration::from_secs(sync_interval),
            concurrency: usize::try_from(concurrency)
                .map_err(|_| ConfigError::Invalid("ROAM_CONCURRENCY"))?,
            timeout: Duration::from_secs(timeout),
        })
    }

    /// Engine configuration for this agent.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig::new(self.device_id.clone())
            .with_concurrency_limit(self.concurrency)
            .with_timeout(self.timeout)
            .with_retry(RetryConfig::default())
    }

    pub fn local_store_path(&self) -> PathBuf {
        self.data_dir.join("local.json")
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join("sync-state.json")
    }
}

fn parse(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("ROAM_REMOTE_URL environment variable is required")]
    MissingRemoteUrl,

    #[error("ROAM_REMOTE_URL must be an http(s) URL, got {0}")]
    InvalidRemoteUrl(String),

    #[error("Invalid {0} value")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::from_lookup(lookup(&[("ROAM_REMOTE_URL", "https://sync.example.com/")]))
            .unwrap();
        assert_eq!(config.remote_url, "https://sync.example.com");
        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.queue_path(), PathBuf::from("./roam-data/sync-state.json"));
        assert!(!config.device_id.is_empty());
    }

    #[test]
    fn overrides() {
        let config = Config::from_lookup(lookup(&[
            ("ROAM_REMOTE_URL", "http://localhost:3000"),
            ("ROAM_DEVICE_ID", "laptop"),
            ("ROAM_DATA_DIR", "/var/lib/roam"),
            ("ROAM_SYNC_INTERVAL_SECS", "5"),
            ("ROAM_CONCURRENCY", "4"),
            ("ROAM_TIMEOUT_SECS", "2"),
        ]))
        .unwrap();

        assert_eq!(config.device_id, "laptop");
        assert_eq!(config.local_store_path(), PathBuf::from("/var/lib/roam/local.json"));
        let sync = config.sync_config();
        assert_eq!(sync.concurrency_limit, 4);
        assert_eq!(sync.timeout, Duration::from_secs(2));
        assert!(sync.validate().is_ok());
    }

    #[test]
    fn missing_url() {
        assert!(matches!(
            Config::from_lookup(lookup(&[])),
            Err(ConfigError::MissingRemoteUrl)
        ));
    }

    #[test]
    fn bad_values() {
        assert!(matches!(
            Config::from_lookup(lookup(&[("ROAM_REMOTE_URL", "ftp://x")])),
            Err(ConfigError::InvalidRemoteUrl(_))
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[
                ("ROAM_REMOTE_URL", "http://x"),
                ("ROAM_CONCURRENCY", "many"),
            ])),
            Err(ConfigError::Invalid("ROAM_CONCURRENCY"))
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[
                ("ROAM_REMOTE_URL", "http://x"),
                ("ROAM_SYNC_INTERVAL_SECS", "0"),
            ])),
            Err(ConfigError::Invalid("ROAM_SYNC_INTERVAL_SECS"))
        ));
    }
}
