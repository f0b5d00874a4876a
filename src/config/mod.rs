//! Server configuration.
//!
//! Values come from, in increasing precedence: built-in defaults, an optional
//! TOML file, then the `SOCKETRY_ADDR` / `SOCKETRY_LOG` environment variables.
//!
//! ```toml
//! addr = "127.0.0.1:3000"
//! poll_interval_ms = 250
//!
//! [cache]
//! enabled = true
//! ttl_secs = 60
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const ENV_ADDR: &str = "SOCKETRY_ADDR";
pub const ENV_LOG: &str = "SOCKETRY_LOG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Response cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: crate::cache::DEFAULT_CAPACITY,
            ttl_secs: crate::cache::DEFAULT_TTL.as_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address, `host:port`.
    pub addr: String,
    /// Bytes requested per socket read.
    pub read_buffer_size: usize,
    /// Largest request (head plus body) buffered before answering `413`.
    pub max_request_size: usize,
    /// Largest WebSocket payload accepted, per frame and per reassembled message.
    pub max_frame_size: usize,
    /// Upper bound on each wait of the accept loop between shutdown checks.
    pub poll_interval_ms: u64,
    /// Idle time allowed before a complete HTTP request has arrived.
    pub request_timeout_ms: u64,
    /// How long shutdown waits for open connections to finish.
    pub drain_timeout_ms: u64,
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub log: String,
    pub cache: CacheConfig,
    pub templates_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_owned(),
            read_buffer_size: 4096,
            max_request_size: 8 * 1024 * 1024,
            max_frame_size: 16 * 1024 * 1024,
            poll_interval_ms: 1000,
            request_timeout_ms: 30_000,
            drain_timeout_ms: 5000,
            log: "info".to_owned(),
            cache: CacheConfig::default(),
            templates_dir: PathBuf::from("views"),
        }
    }
}

impl ServerConfig {
    /// Parses a TOML document; missing keys keep their defaults.
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Reads `path` if given (defaults otherwise), applies environment
    /// overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_owned(),
                    source,
                })?;
                Self::from_toml(&source)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Applies `SOCKETRY_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup(ENV_ADDR).filter(|v| !v.is_empty()) {
            self.addr = addr;
        }
        if let Some(log) = lookup(ENV_LOG).filter(|v| !v.is_empty()) {
            self.log = log;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_owned()));
        if self.addr.trim().is_empty() {
            return invalid("addr must not be empty");
        }
        if self.read_buffer_size == 0 {
            return invalid("read_buffer_size must be greater than zero");
        }
        if self.max_request_size == 0 || self.max_frame_size == 0 {
            return invalid("max_request_size and max_frame_size must be greater than zero");
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be greater than zero");
        }
        if self.request_timeout_ms == 0 {
            return invalid("request_timeout_ms must be greater than zero");
        }
        if self.cache.enabled && self.cache.capacity == 0 {
            return invalid("cache.capacity must be greater than zero when the cache is enabled");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.addr, "0.0.0.0:8080");
        assert_eq!(config.max_request_size, 8 * 1024 * 1024);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert!(!config.cache.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ServerConfig::from_toml(
            r#"
            addr = "127.0.0.1:3000"

            [cache]
            enabled = true
            ttl_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.addr, "127.0.0.1:3000");
        assert_eq!(config.read_buffer_size, 4096);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.capacity, 100);
        assert_eq!(config.cache.ttl(), Duration::from_secs(60));
    }

    #[test]
    fn rejects_bad_toml() {
        assert!(matches!(
            ServerConfig::from_toml("addr = 5"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn env_overrides_win() {
        let mut config = ServerConfig::default();
        config.apply_overrides(|key| match key {
            ENV_ADDR => Some("127.0.0.1:9999".to_owned()),
            ENV_LOG => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.addr, "127.0.0.1:9999");
        assert_eq!(config.log, "info");
    }

    #[test]
    fn validation() {
        let config = ServerConfig {
            poll_interval_ms: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
