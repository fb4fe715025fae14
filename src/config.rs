//! # Bridge Configuration
//!
//! All tunables of the bridge in one TOML document, one table per component:
//!
//! ```text
//! [broker]       MqttConfig        host, credentials, topic prefix, QoS
//! [backoff]      BackoffConfig     reconnect delays
//! [commands]     CommandConfig     ack / request timeouts, retention
//! [readings]     ReadingConfig     staleness window
//! [subscribers]  SubscriberConfig  eviction threshold, delivery timeouts
//! [http]         HttpConfig        listen address
//! [logging]      LoggingConfig     default log level
//! ```
//!
//! ## Lookup Order
//!
//! 1. `$GASBRIDGE_CONFIG`
//! 2. `<config_dir>/gasbridge/bridge.toml`
//! 3. built-in defaults
//!
//! Missing keys fall back to their defaults, so a file only needs the values
//! that differ. Environment overrides are applied last.

use crate::dispatcher::CommandConfig;
use crate::mqtt::{BackoffConfig, MqttConfig};
use crate::registry::SubscriberConfig;
use crate::router::device_id_is_valid;
use crate::store::ReadingConfig;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const CONFIG_ENV: &str = "GASBRIDGE_CONFIG";
const CONFIG_DIR: &str = "gasbridge";
const CONFIG_FILE: &str = "bridge.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5000".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub broker: MqttConfig,
    pub backoff: BackoffConfig,
    pub commands: CommandConfig,
    pub readings: ReadingConfig,
    pub subscribers: SubscriberConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    /// Loads the configuration from the first location that exists
    pub fn load() -> Result<Self> {
        let mut config = match Self::locate(std::env::var(CONFIG_ENV).ok()) {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                Self::from_file(&path)?
            }
            None => {
                info!("No configuration file found, using defaults");
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        debug!("Effective configuration: {:?}", config);
        Ok(config)
    }

    /// Explicit path wins; otherwise the per-user file if present
    fn locate(explicit: Option<String>) -> Option<PathBuf> {
        if let Some(path) = explicit.filter(|p| !p.trim().is_empty()) {
            return Some(PathBuf::from(path));
        }
        let candidate = dirs::config_dir()?.join(CONFIG_DIR).join(CONFIG_FILE);
        candidate.is_file().then_some(candidate)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies the supported environment overrides through `lookup`
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup("GASBRIDGE_BROKER_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = lookup("GASBRIDGE_BROKER_PORT") {
            self.broker.port = parse_override("GASBRIDGE_BROKER_PORT", &port)?;
        }
        if let Some(username) = lookup("GASBRIDGE_BROKER_USERNAME") {
            self.broker.username = Some(username);
        }
        if let Some(password) = lookup("GASBRIDGE_BROKER_PASSWORD") {
            self.broker.password = Some(password);
        }
        if let Some(port) = lookup("PORT") {
            let port: u16 = parse_override("PORT", &port)?;
            let host = self
                .http
                .bind
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.http.bind = format!("{}:{}", host, port);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(invalid("broker.host", "must not be empty"));
        }
        let prefix = self.broker.topic_prefix.trim_matches('/');
        if prefix.is_empty() {
            return Err(invalid("broker.topic_prefix", "must not be empty"));
        }
        if !prefix.split('/').all(device_id_is_valid) {
            return Err(invalid(
                "broker.topic_prefix",
                "levels must be non-empty and free of wildcards and control characters",
            ));
        }
        if self.broker.qos > 2 {
            return Err(invalid("broker.qos", "must be 0, 1 or 2"));
        }
        if self.broker.connect_attempts == 0 {
            return Err(invalid("broker.connect_attempts", "must be at least 1"));
        }
        if self.backoff.initial_ms == 0 {
            return Err(invalid("backoff.initial_ms", "must be positive"));
        }
        if self.backoff.initial_ms > self.backoff.max_ms {
            return Err(invalid(
                "backoff.initial_ms",
                "must not exceed backoff.max_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(invalid("backoff.jitter", "must be between 0.0 and 1.0"));
        }
        if self.commands.ack_timeout_ms == 0 {
            return Err(invalid("commands.ack_timeout_ms", "must be positive"));
        }
        if self.commands.request_timeout_ms == 0 {
            return Err(invalid("commands.request_timeout_ms", "must be positive"));
        }
        if self.readings.staleness_secs == 0 {
            return Err(invalid("readings.staleness_secs", "must be positive"));
        }
        if self.subscribers.eviction_threshold == 0 {
            return Err(invalid("subscribers.eviction_threshold", "must be positive"));
        }
        if self.subscribers.delivery_timeout_ms == 0 {
            return Err(invalid("subscribers.delivery_timeout_ms", "must be positive"));
        }
        if self.subscribers.queue_capacity == 0 {
            return Err(invalid("subscribers.queue_capacity", "must be positive"));
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.http
            .bind
            .parse()
            .map_err(|e| invalid("http.bind", &format!("{}: {}", self.http.bind, e)))
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, &format!("{:?}: {}", value, e)))
}
