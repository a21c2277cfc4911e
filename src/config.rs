use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::connection::link::LinkSettings;
use crate::error::TransportError;
use crate::protocol::constants::{ProtocolVersion, DEFAULT_PORT};
use crate::protocol::handshake::Credentials;

pub const DEFAULT_CONFIG_FILE: &str = "i2tcp.toml";
pub const DEFAULT_KEY: &str = "change-this-key";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    pub key: String,
    pub protocol: ProtocolVersion,
    /// Offer an RSA-wrapped session key after authentication
    pub secured: bool,
    pub rsa_bits: usize,
    pub max_connections: usize,
    pub buffer_max: usize,
    pub handshake_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub watchdog_timeout_ms: u64,
    pub watchdog_tick_ms: u64,
    pub key_bucket_secs: f64,
    pub key_flush_rounds: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: format!("0.0.0.0:{}", DEFAULT_PORT),
            key: DEFAULT_KEY.to_string(),
            protocol: ProtocolVersion::default(),
            secured: true,
            rsa_bits: 1024,
            max_connections: 20,
            buffer_max: 256,
            handshake_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            watchdog_timeout_ms: 15_000,
            watchdog_tick_ms: 500,
            key_bucket_secs: 100.0,
            key_flush_rounds: 1,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.max_connections == 0 {
            return Err(TransportError::Config("max_connections must be at least 1".into()));
        }
        validate_common(self.key.as_bytes(), self.watchdog_timeout_ms, self.watchdog_tick_ms)
    }

    pub fn credentials(&self) -> Result<Credentials, TransportError> {
        Credentials::new(self.key.as_bytes(), self.protocol, self.key_bucket_secs, self.key_flush_rounds)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub(crate) fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            watchdog_timeout: Duration::from_millis(self.watchdog_timeout_ms),
            watchdog_tick: Duration::from_millis(self.watchdog_tick_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            heartbeat: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub address: String,
    pub key: String,
    pub protocol: ProtocolVersion,
    /// Refuse servers that only offer authentication
    pub require_secured: bool,
    pub buffer_max: usize,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub watchdog_timeout_ms: u64,
    pub watchdog_tick_ms: u64,
    pub heartbeat: bool,
    pub auto_reconnect: bool,
    pub reconnect_interval_ms: u64,
    /// Give up after this many failed attempts in a row; unlimited if unset
    pub max_reconnect_tries: Option<u32>,
    pub key_bucket_secs: f64,
    pub key_flush_rounds: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{}", DEFAULT_PORT),
            key: DEFAULT_KEY.to_string(),
            protocol: ProtocolVersion::default(),
            require_secured: false,
            buffer_max: 256,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            watchdog_timeout_ms: 15_000,
            watchdog_tick_ms: 500,
            heartbeat: true,
            auto_reconnect: false,
            reconnect_interval_ms: 5_000,
            max_reconnect_tries: None,
            key_bucket_secs: 100.0,
            key_flush_rounds: 1,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        validate_common(self.key.as_bytes(), self.watchdog_timeout_ms, self.watchdog_tick_ms)
    }

    pub fn credentials(&self) -> Result<Credentials, TransportError> {
        Credentials::new(self.key.as_bytes(), self.protocol, self.key_bucket_secs, self.key_flush_rounds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub(crate) fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            watchdog_timeout: Duration::from_millis(self.watchdog_timeout_ms),
            watchdog_tick: Duration::from_millis(self.watchdog_tick_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            heartbeat: self.heartbeat,
        }
    }
}

fn validate_common(key: &[u8], watchdog_timeout_ms: u64, watchdog_tick_ms: u64) -> Result<(), TransportError> {
    if key.len() <= 1 {
        return Err(TransportError::Config("key must be at least 2 bytes".into()));
    }
    if watchdog_tick_ms == 0 {
        return Err(TransportError::Config("watchdog_tick_ms must be positive".into()));
    }
    if watchdog_timeout_ms <= watchdog_tick_ms {
        return Err(TransportError::Config("watchdog_timeout_ms must exceed watchdog_tick_ms".into()));
    }
    Ok(())
}

/// On-disk configuration for the `i2tcp` binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl NodeConfig {
    pub fn load_or_create(config_path: Option<&str>) -> Result<Self> {
        let config_file = config_path.unwrap_or(DEFAULT_CONFIG_FILE);

        if std::path::Path::new(config_file).exists() {
            let content = std::fs::read_to_string(config_file)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save(config_file)?;
            tracing::info!("Wrote default configuration to {}", config_file);
            Ok(config)
        }
    }

    pub fn save(&self, config_path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }
}
