//! Poller configuration
//!
//! Every section has defaults, so a config file only needs the values that
//! differ. Files are YAML (`.yaml`, `.yml`) or JSON (`.json`).
//!
//! ```yaml
//! server:
//!   bind_address: "0.0.0.0:8899"
//! catalog:
//!   directory: /etc/poller/catalog
//! registry:
//!   path: /etc/poller/devices.yaml
//! sink:
//!   type: file
//!   path: /var/lib/poller/telemetry.jsonl
//! logging:
//!   level: debug
//!   packet_logging: true
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PollerError, PollerResult};
use crate::logging::{LogLevel, LoggingMode};
use crate::transport::RetryBudget;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub bundling: BundlingConfig,
    pub catalog: CatalogConfig,
    pub registry: RegistryConfig,
    pub sink: SinkConfig,
    pub logging: LoggingConfig,
}

impl PollerConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> PollerResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PollerError::configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;

        let config: PollerConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&text)?,
            Some("json") => serde_json::from_str(&text)?,
            other => {
                return Err(PollerError::configuration(format!(
                    "Unsupported config format: {:?}",
                    other
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the poller cannot run with
    pub fn validate(&self) -> PollerResult<()> {
        let session = &self.session;
        if session.unit_id == 0 {
            return Err(PollerError::configuration("session.unit_id must not be 0"));
        }
        for (name, value) in [
            ("session.request_timeout_ms", session.request_timeout_ms),
            ("session.cycle_interval_ms", session.cycle_interval_ms),
            ("session.idle_check_interval_ms", session.idle_check_interval_ms),
            ("bundling.ttl_ms", self.bundling.ttl_ms),
        ] {
            if value == 0 {
                return Err(PollerError::configuration(format!("{} must be greater than 0", name)));
            }
        }
        if session.retry_budget_initial > session.retry_budget_max {
            return Err(PollerError::configuration(
                "session.retry_budget_initial exceeds session.retry_budget_max",
            ));
        }
        if self.server.max_connections == 0 {
            return Err(PollerError::configuration("server.max_connections must be greater than 0"));
        }
        Ok(())
    }
}

/// Listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{}", crate::DEFAULT_LISTEN_PORT),
            max_connections: 100,
        }
    }
}

/// Per-device session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub unit_id: u8,
    /// First register of the four-word identity block
    pub identity_register: u16,
    pub request_timeout_ms: u64,
    pub max_retries_per_request: u32,
    pub retry_budget_initial: u32,
    pub retry_budget_max: u32,
    pub retry_budget_replenish: u32,
    pub cycle_interval_ms: u64,
    /// Delay before dropping a device that failed authentication
    pub auth_cooldown_ms: u64,
    pub idle_check_interval_ms: u64,
    /// Exception codes that skip a value instead of ending the session
    pub benign_exception_codes: Vec<u8>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            unit_id: 1,
            identity_register: crate::IDENTITY_REGISTER,
            request_timeout_ms: 3000,
            max_retries_per_request: 2,
            retry_budget_initial: 3,
            retry_budget_max: 5,
            retry_budget_replenish: 1,
            cycle_interval_ms: 5000,
            auth_cooldown_ms: 10_000,
            idle_check_interval_ms: 1000,
            benign_exception_codes: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn auth_cooldown(&self) -> Duration {
        Duration::from_millis(self.auth_cooldown_ms)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }

    pub fn retry_budget(&self) -> RetryBudget {
        RetryBudget::new(
            self.retry_budget_initial,
            self.retry_budget_max,
            self.retry_budget_replenish,
        )
    }

    pub fn is_benign_exception(&self, code: u8) -> bool {
        self.benign_exception_codes.contains(&code)
    }
}

/// Register bundling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundlingConfig {
    pub max_gap: u16,
    pub ttl_ms: u64,
}

impl Default for BundlingConfig {
    fn default() -> Self {
        Self {
            max_gap: crate::bundle::DEFAULT_MAX_GAP,
            ttl_ms: crate::bundle::DEFAULT_TTL.as_millis() as u64,
        }
    }
}

impl BundlingConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Location of the per-series JSON catalogs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub directory: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("catalog"),
        }
    }
}

/// Location of the device registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("devices.yaml"),
        }
    }
}

/// Where snapshots go
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    #[default]
    Console,
    File {
        path: PathBuf,
    },
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Dump every frame at debug level
    pub packet_logging: bool,
    pub packet_mode: LoggingMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PollerConfig::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:8899");
        assert_eq!(config.session.identity_register, 0x1400);
        assert_eq!(config.session.request_timeout(), Duration::from_secs(3));
        assert_eq!(config.session.cycle_interval(), Duration::from_secs(5));
        assert_eq!(config.bundling.max_gap, 9);
        assert_eq!(config.bundling.ttl(), Duration::from_secs(10));
        assert_eq!(config.session.retry_budget().available(), 3);
        assert_eq!(config.sink, SinkConfig::Console);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poller.yaml");
        std::fs::write(
            &path,
            "session:\n  cycle_interval_ms: 1000\n  benign_exception_codes: [2]\n\
             sink:\n  type: file\n  path: out.jsonl\nlogging:\n  level: debug\n",
        )
        .unwrap();

        let config = PollerConfig::load(&path).unwrap();
        assert_eq!(config.session.cycle_interval_ms, 1000);
        assert_eq!(config.session.request_timeout_ms, 3000);
        assert!(config.session.is_benign_exception(2));
        assert!(!config.session.is_benign_exception(4));
        assert_eq!(config.sink, SinkConfig::File { path: PathBuf::from("out.jsonl") });
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poller.json");
        std::fs::write(&path, r#"{"server": {"bind_address": "127.0.0.1:9000"}}"#).unwrap();

        let config = PollerConfig::load(&path).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:9000");
        assert_eq!(config.server.max_connections, 100);
    }

    #[test]
    fn test_validation() {
        let mut config = PollerConfig::default();
        config.session.unit_id = 0;
        assert!(config.validate().is_err());

        let mut config = PollerConfig::default();
        config.session.request_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(PollerError::Configuration { .. })));

        let mut config = PollerConfig::default();
        config.bundling.ttl_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poller.ini");
        std::fs::write(&path, "").unwrap();
        assert!(PollerConfig::load(&path).is_err());
    }
}
