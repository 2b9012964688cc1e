//! Per-broker connection settings

use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;

use super::ConfigError;
use crate::protocol::ProtocolVersion;
use crate::transport::ConnectOptions;

/// Port assumed when an address carries none
pub const DEFAULT_PORT: u16 = 1883;

/// Default client id of the upstream leg
pub const UPSTREAM_CLIENT_ID: &str = "mqtt_bridge_external";

/// Default client id of the downstream leg
pub const DOWNSTREAM_CLIENT_ID: &str = "mqtt_bridge_local";

/// Connection settings for one leg
///
/// ```toml
/// [upstream]
/// address = "172.24.131.97:1883"
/// client_id = "mqtt_bridge_external"
/// clean_session = false
/// keepalive = "60s"
/// protocol_version = "v3.1.1"
/// username = "${BROKER_USER}"
/// password = "${BROKER_PASS}"
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LegConfig {
    /// Broker address (host:port, port defaults to 1883)
    pub address: String,
    /// Client ID, the leg's default when empty
    pub client_id: String,
    /// Start without a persisted broker-side session
    pub clean_session: bool,
    /// Keep alive interval, "0s" disables pings
    #[serde(with = "humantime_serde")]
    pub keepalive: Duration,
    /// Time allowed for TCP connect and CONNACK
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub protocol_version: ProtocolVersion,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for LegConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            client_id: String::new(),
            clean_session: false,
            keepalive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            protocol_version: ProtocolVersion::V311,
            username: None,
            password: None,
        }
    }
}

impl LegConfig {
    /// Parse address into host and port
    pub fn parse_address(&self) -> Result<(String, u16), ConfigError> {
        let address = self.address.trim();
        let (host, port) = match address.rsplit_once(':') {
            // Bare IPv6 literal without brackets carries no port
            Some((host, _)) if host.contains(':') && !host.ends_with(']') => {
                (address, DEFAULT_PORT)
            }
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    ConfigError::Validation(format!("invalid port in address '{}'", self.address))
                })?;
                (host, port)
            }
            None => (address, DEFAULT_PORT),
        };

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ConfigError::Validation(format!(
                "missing host in address '{}'",
                self.address
            )));
        }
        if port == 0 {
            return Err(ConfigError::Validation(format!(
                "port 0 in address '{}'",
                self.address
            )));
        }
        Ok((host.to_string(), port))
    }

    /// Client options for this leg
    pub fn connect_options(&self) -> Result<ConnectOptions, ConfigError> {
        let (host, port) = self.parse_address()?;
        Ok(ConnectOptions {
            host,
            port,
            client_id: self.client_id.clone(),
            clean_session: self.clean_session,
            keepalive: self.keepalive,
            connect_timeout: self.connect_timeout,
            protocol_version: self.protocol_version,
            username: self.username().map(str::to_string),
            password: self.password().map(|p| Bytes::copy_from_slice(p.as_bytes())),
        })
    }

    /// Username sent in CONNECT; empty counts as unset
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref().filter(|u| !u.is_empty())
    }

    /// Password sent in CONNECT; empty counts as unset
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }

    pub(super) fn validate(&self, leg: &str) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "{}.address is required",
                leg
            )));
        }
        if let Err(e) = self.parse_address() {
            let detail = match e {
                ConfigError::Validation(msg) => msg,
                other => other.to_string(),
            };
            return Err(ConfigError::Validation(format!("{}: {}", leg, detail)));
        }

        if self.client_id.is_empty() {
            return Err(ConfigError::Validation(format!(
                "{}.client_id cannot be empty",
                leg
            )));
        }
        if self.keepalive.as_secs() > u16::MAX as u64 {
            return Err(ConfigError::Validation(format!(
                "{}.keepalive must not exceed {} seconds",
                leg,
                u16::MAX
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Validation(format!(
                "{}.connect_timeout must be greater than zero",
                leg
            )));
        }
        if self.password().is_some()
            && self.username().is_none()
            && self.protocol_version == ProtocolVersion::V311
        {
            return Err(ConfigError::Validation(format!(
                "{}.password requires a username with MQTT v3.1.1",
                leg
            )));
        }
        Ok(())
    }
}
