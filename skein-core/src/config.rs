//! Configuration loading for SKEIN clients.
//!
//! Every field has a default; a TOML file only needs to name what differs.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "SKEIN_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Base URL joined with every relative resource URI.
    pub api_base_url: String,
    pub event_stream_path: String,
    pub login_path: String,
    pub logout_path: String,
    pub whoami_path: String,
    pub request_timeout_ms: u64,
    /// Simultaneous outbound reads allowed before queueing.
    pub max_concurrent_reads: usize,
    pub default_poll_interval_ms: u64,
    pub election_timeout_ms: u64,
    pub election_max_attempts: u32,
    pub owner_check_interval_ms: u64,
    /// Advisory lock arbitrating push ownership.
    pub lock_name: String,
    /// Response envelope key to unwrap, if the server wraps bodies.
    pub envelope_key: Option<String>,
    pub reconnect: ReconnectConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            event_stream_path: "/redfish/v1/EventService/SSE".to_string(),
            login_path: "/login".to_string(),
            logout_path: "/logout".to_string(),
            whoami_path: "/whoami".to_string(),
            request_timeout_ms: 30_000,
            max_concurrent_reads: 10,
            default_poll_interval_ms: 10_000,
            election_timeout_ms: 3_000,
            election_max_attempts: 3,
            owner_check_interval_ms: 30_000,
            lock_name: "push-ownership".to_string(),
            envelope_key: None,
            reconnect: ReconnectConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter_ms: 250,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ClientConfig {
    /// Load from `--config <path>` or `SKEIN_CONFIG`, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api_base_url",
                reason: "must not be empty".to_string(),
            });
        }
        for (field, value) in [
            ("event_stream_path", &self.event_stream_path),
            ("login_path", &self.login_path),
            ("logout_path", &self.logout_path),
            ("whoami_path", &self.whoami_path),
        ] {
            if !value.starts_with('/') {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must start with '/'".to_string(),
                });
            }
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.max_concurrent_reads == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrent_reads",
                reason: "must be > 0".to_string(),
            });
        }
        if self.default_poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "default_poll_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.election_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "election_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.election_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "election_max_attempts",
                reason: "must be > 0".to_string(),
            });
        }
        if self.owner_check_interval_ms < self.election_timeout_ms {
            return Err(ConfigError::InvalidValue {
                field: "owner_check_interval_ms",
                reason: "must be >= election_timeout_ms".to_string(),
            });
        }
        if self.lock_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "lock_name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.reconnect.initial_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.initial_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.max_ms",
                reason: "must be >= initial_ms".to_string(),
            });
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.multiplier",
                reason: "must be >= 1.0".to_string(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn default_poll_interval(&self) -> Duration {
        Duration::from_millis(self.default_poll_interval_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn owner_check_interval(&self) -> Duration {
        Duration::from_millis(self.owner_check_interval_ms)
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_reads, 10);
        assert_eq!(config.election_timeout(), Duration::from_secs(3));
        assert_eq!(config.lock_name, "push-ownership");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ClientConfig::from_toml(
            r#"
            api_base_url = "https://bmc.example.com"
            max_concurrent_reads = 4

            [reconnect]
            initial_ms = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.api_base_url, "https://bmc.example.com");
        assert_eq!(config.max_concurrent_reads, 4);
        assert_eq!(config.reconnect.initial_ms, 100);
        assert_eq!(config.reconnect.max_ms, 30_000);
        assert_eq!(config.default_poll_interval_ms, 10_000);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = ClientConfig::from_toml("nonsense = 1");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = ClientConfig {
            max_concurrent_reads: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "max_concurrent_reads",
                ..
            })
        ));
    }

    #[test]
    fn test_owner_check_shorter_than_timeout_rejected() {
        let config = ClientConfig {
            owner_check_interval_ms: 1_000,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_relative_path_rejected() {
        let config = ClientConfig {
            login_path: "login".to_string(),
            ..ClientConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "login_path",
                ..
            })
        ));
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "election_timeout_ms = 1500").unwrap();
        writeln!(file, "owner_check_interval_ms = 1500").unwrap();
        let config = ClientConfig::from_path(file.path()).unwrap();
        assert_eq!(config.election_timeout_ms, 1500);
        assert!(config.validate().is_ok());
    }
}
