//! Configuration Module
//!
//! Provides TOML-based configuration for relaymq with support for:
//! - Upstream and downstream broker connection settings
//! - Relay behaviour (topic filter, QoS, supervisor timing, reconnect policy)
//! - In-file environment variable substitution (`${VAR}`, `${VAR:-default}`)
//! - Environment variable overrides (`RELAYMQ__` prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use leg::{LegConfig, DEFAULT_PORT, DOWNSTREAM_CLIENT_ID, UPSTREAM_CLIENT_ID};

use crate::bridge::ReconnectPolicy;
use crate::protocol::QoS;
use crate::topic::validate_topic_filter;

mod leg;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker messages are received from
    pub upstream: LegConfig,
    /// Broker messages are republished to
    pub downstream: LegConfig,
    /// Relay behaviour
    pub relay: RelayConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// How downed legs are retried
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectMode {
    /// Retry on every poll tick
    #[default]
    Fixed,
    /// Double the wait after each failure, up to `max_reconnect_interval`
    Backoff,
}

/// Relay configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// Topic filter subscribed on upstream
    pub topic_filter: String,
    /// QoS requested for the upstream subscription (0, 1, or 2)
    pub subscribe_qos: u8,
    /// Shared subscription group, empty for a plain subscription
    pub shared_group: Option<String>,
    /// Supervisor check interval
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long startup waits for both legs
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,
    pub reconnect: ReconnectMode,
    /// Upper bound for the backoff wait
    #[serde(with = "humantime_serde")]
    pub max_reconnect_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            topic_filter: "sensors/#".to_string(),
            subscribe_qos: 1,
            shared_group: None,
            poll_interval: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(3),
            reconnect: ReconnectMode::Fixed,
            max_reconnect_interval: Duration::from_secs(60),
        }
    }
}

impl RelayConfig {
    pub fn qos(&self) -> QoS {
        QoS::from_u8(self.subscribe_qos).unwrap_or(QoS::AtLeastOnce)
    }

    /// Share group, `None` when unset or empty
    pub fn shared_group(&self) -> Option<String> {
        self.shared_group
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        match self.reconnect {
            ReconnectMode::Fixed => ReconnectPolicy::Fixed,
            ReconnectMode::Backoff => ReconnectPolicy::Backoff {
                max: self.max_reconnect_interval,
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_topic_filter(&self.topic_filter).map_err(|e| {
            ConfigError::Validation(format!(
                "relay.topic_filter '{}' is invalid: {}",
                self.topic_filter, e
            ))
        })?;

        if self.subscribe_qos > 2 {
            return Err(ConfigError::Validation(
                "relay.subscribe_qos must be 0, 1, or 2".to_string(),
            ));
        }

        if let Some(group) = self.shared_group() {
            if group.contains(['/', '+', '#']) {
                return Err(ConfigError::Validation(format!(
                    "relay.shared_group '{}' cannot contain '/', '+' or '#'",
                    group
                )));
            }
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::Validation(
                "relay.poll_interval must be greater than zero".to_string(),
            ));
        }

        if self.reconnect == ReconnectMode::Backoff
            && self.max_reconnect_interval < self.poll_interval
        {
            return Err(ConfigError::Validation(
                "relay.max_reconnect_interval must be at least relay.poll_interval".to_string(),
            ));
        }

        Ok(())
    }
}

/// Values given on the command line, applied over the loaded configuration
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub upstream: Option<String>,
    pub downstream: Option<String>,
    pub topic_filter: Option<String>,
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides,
    /// then validate it.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `RELAYMQ__` prefix with double underscores for nesting:
    ///    - `RELAYMQ__UPSTREAM__ADDRESS=10.0.0.5:1883` overrides `upstream.address`
    ///    - `RELAYMQ__RELAY__POLL_INTERVAL=10s` overrides `relay.poll_interval`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`] but without validation, so command line
    /// overrides can be applied first
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::build(Some(path.as_ref()))
    }

    fn build(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("relay.topic_filter", "sensors/#")?
            .set_default("relay.subscribe_qos", 1)?
            .set_default("relay.poll_interval", "5s")?
            .set_default("relay.startup_timeout", "3s")?
            .set_default("relay.reconnect", "fixed")?
            .set_default("relay.max_reconnect_interval", "60s")?;

        // Load from file with env var substitution
        if let Some(path) = path {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content);
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        // Override with environment variables (RELAYMQ__UPSTREAM__ADDRESS, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("RELAYMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = cfg.try_deserialize()?;
        config.fill_client_ids();
        Ok(config)
    }

    /// Load configuration from environment variables only (no file).
    ///
    /// Useful for containerized deployments where all config comes from env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::build(None)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.fill_client_ids();
        config.validate()?;
        Ok(config)
    }

    /// Apply command line values
    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(address) = &overrides.upstream {
            self.upstream.address = address.clone();
        }
        if let Some(address) = &overrides.downstream {
            self.downstream.address = address.clone();
        }
        if let Some(filter) = &overrides.topic_filter {
            self.relay.topic_filter = filter.clone();
        }
        if let Some(level) = &overrides.log_level {
            self.log.level = level.clone();
        }
    }

    fn fill_client_ids(&mut self) {
        if self.upstream.client_id.is_empty() {
            self.upstream.client_id = UPSTREAM_CLIENT_ID.to_string();
        }
        if self.downstream.client_id.is_empty() {
            self.downstream.client_id = DOWNSTREAM_CLIENT_ID.to_string();
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.upstream.validate("upstream")?;
        self.downstream.validate("downstream")?;

        // Same id on the same broker would make the legs kick each other off
        if self.upstream.client_id == self.downstream.client_id {
            return Err(ConfigError::Validation(format!(
                "upstream and downstream cannot share client_id '{}'",
                self.upstream.client_id
            )));
        }

        self.relay.validate()?;

        match self.log.level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "log.level '{}' must be one of error, warn, info, debug, trace",
                other
            ))),
        }
    }
}
