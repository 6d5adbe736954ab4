//! Runtime configuration for the sync core.
//!
//! Resolution order: built-in defaults, then an optional JSON file, then
//! `REPAIR_MINDER_*` environment variables.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::api::normalize_base_url;

pub const ENV_API_URL: &str = "REPAIR_MINDER_API_URL";
pub const ENV_DB_PATH: &str = "REPAIR_MINDER_DB_PATH";
pub const ENV_PAGE_SIZE: &str = "REPAIR_MINDER_PAGE_SIZE";
pub const ENV_LOG_DIR: &str = "REPAIR_MINDER_LOG_DIR";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub database_path: PathBuf,
    /// Records per pull page.
    pub page_size: u32,
    /// Records per remote search call.
    pub search_page_size: u32,
    pub request_timeout_secs: u64,
    /// How long `Completed` stays visible before the status returns to idle.
    pub completed_reset_delay_ms: u64,
    pub background_interval_secs: u64,
    pub health_probe_interval_secs: u64,
    /// Failed push attempts before a local change is parked.
    pub max_push_attempts: u32,
    pub log_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.repairminder.com".to_string(),
            database_path: PathBuf::from("repair-minder-cache.db"),
            page_size: 100,
            search_page_size: 50,
            request_timeout_secs: 30,
            completed_reset_delay_ms: 2000,
            background_interval_secs: 15 * 60,
            health_probe_interval_secs: 30,
            max_push_attempts: 10,
            log_dir: None,
        }
    }
}

impl SyncConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                let parsed: SyncConfig =
                    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                        path: path.to_path_buf(),
                        source,
                    })?;
                info!("Loaded sync config from {}", path.display());
                parsed
            }
            Some(path) => {
                debug!("No config file at {}, using defaults", path.display());
                SyncConfig::default()
            }
            None => SyncConfig::default(),
        };

        config.apply_env()?;
        config.api_base_url = normalize_base_url(&config.api_base_url);
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(url) = env_value(ENV_API_URL) {
            self.api_base_url = url;
        }
        if let Some(db_path) = env_value(ENV_DB_PATH) {
            self.database_path = PathBuf::from(db_path);
        }
        if let Some(raw) = env_value(ENV_PAGE_SIZE) {
            self.page_size = raw.parse().map_err(|_| ConfigError::Invalid {
                key: ENV_PAGE_SIZE,
                value: raw.clone(),
            })?;
        }
        if let Some(dir) = env_value(ENV_LOG_DIR) {
            self.log_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Reject values the runtime cannot work with (zero sizes and intervals).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.is_empty() {
            return Err(ConfigError::Invalid {
                key: "api_base_url",
                value: String::new(),
            });
        }
        let positive = [
            ("page_size", u64::from(self.page_size)),
            ("search_page_size", u64::from(self.search_page_size)),
            ("request_timeout_secs", self.request_timeout_secs),
            ("background_interval_secs", self.background_interval_secs),
            ("health_probe_interval_secs", self.health_probe_interval_secs),
            ("max_push_attempts", u64::from(self.max_push_attempts)),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    value: "0".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn completed_reset_delay(&self) -> Duration {
        Duration::from_millis(self.completed_reset_delay_ms)
    }

    pub fn background_interval(&self) -> Duration {
        Duration::from_secs(self.background_interval_secs)
    }

    pub fn health_probe_interval(&self) -> Duration {
        Duration::from_secs(self.health_probe_interval_secs)
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [ENV_API_URL, ENV_DB_PATH, ENV_PAGE_SIZE, ENV_LOG_DIR] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = SyncConfig::load(None).unwrap();
        assert_eq!(config.page_size, 100);
        assert_eq!(config.search_page_size, 50);
        assert_eq!(config.background_interval(), Duration::from_secs(900));
        assert_eq!(config.completed_reset_delay(), Duration::from_secs(2));
        assert_eq!(config.api_base_url, "https://api.repairminder.com");
    }

    #[test]
    #[serial]
    fn test_file_then_env_layering() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        fs::write(
            &path,
            r#"{ "api_base_url": "staging.repairminder.com/api/", "page_size": 25, "max_push_attempts": 3 }"#,
        )
        .unwrap();

        let config = SyncConfig::load(Some(&path)).unwrap();
        assert_eq!(config.api_base_url, "https://staging.repairminder.com");
        assert_eq!(config.page_size, 25);
        assert_eq!(config.max_push_attempts, 3);
        assert_eq!(config.request_timeout_secs, 30);

        std::env::set_var(ENV_PAGE_SIZE, "40");
        std::env::set_var(ENV_DB_PATH, "/tmp/rm.db");
        let config = SyncConfig::load(Some(&path)).unwrap();
        assert_eq!(config.page_size, 40);
        assert_eq!(config.database_path, PathBuf::from("/tmp/rm.db"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_rejected() {
        clear_env();
        std::env::set_var(ENV_PAGE_SIZE, "lots");
        assert!(matches!(
            SyncConfig::load(None),
            Err(ConfigError::Invalid { key: ENV_PAGE_SIZE, .. })
        ));

        std::env::set_var(ENV_PAGE_SIZE, "0");
        assert!(matches!(
            SyncConfig::load(None),
            Err(ConfigError::Invalid { key: "page_size", .. })
        ));
        clear_env();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            SyncConfig::load(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(config, SyncConfig::default());
    }
}
