use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Serialize, Deserialize};

use super::{Error, Result};

/// Stable identity of a mesh node (e.g. `!a1b2c3d4`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Creates a peer id, rejecting empty strings
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            None
        } else {
            Some(PeerId(id))
        }
    }

    /// Returns the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection settings for the local radio device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Transport endpoint (serial path, socket address); empty means auto-detect
    pub address: String,
    /// Bound on a single connect attempt
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub connect_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            address: String::new(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Identity key verification settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Expected device private key, base64 encoded
    pub private_key: Option<String>,
    /// External provisioning command; `{key}` is replaced with the base64 key
    pub provision_command: Vec<String>,
    /// Bound on the provisioning command
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub provision_timeout: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            private_key: None,
            provision_command: Vec::new(),
            provision_timeout: Duration::from_secs(60),
        }
    }
}

impl SecurityConfig {
    /// Decodes the configured key, if any
    pub fn decoded_key(&self) -> Result<Option<Vec<u8>>> {
        use base64::Engine as _;

        match self.private_key.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map(Some)
                .map_err(|e| Error::config(format!("invalid base64 private key: {}", e))),
        }
    }
}

/// Private channel addressing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Channel index carrying the private protocol
    pub private_channel_index: u8,
    /// Application port number of the private protocol
    pub private_port: u16,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            private_channel_index: super::DEFAULT_PRIVATE_CHANNEL,
            private_port: super::PRIVATE_PORT_NUM,
        }
    }
}

/// Protocol behaviour knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    /// Answer ACK_REQUESTED frames
    pub send_ack: bool,
    /// Largest outbound payload accepted by the link
    pub max_payload: usize,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        ProtocolSettings {
            send_ack: true,
            max_payload: super::MAX_PAYLOAD_SIZE,
        }
    }
}

/// Peer tracking limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Maximum number of tracked peers
    pub max_peers: usize,
    /// Batches remembered per peer
    pub history_capacity: usize,
    /// Silence after which a peer is marked offline
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub offline_timeout: Duration,
    /// Interval between liveness sweeps
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub sweep_interval: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            max_peers: super::MAX_PEERS,
            history_capacity: super::MAX_DATA_BATCHES,
            offline_timeout: Duration::from_secs(super::DEFAULT_OFFLINE_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Scheduled position broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionConfig {
    pub broadcast_enabled: bool,
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub broadcast_interval: Duration,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<i32>,
}

impl Default for PositionConfig {
    fn default() -> Self {
        PositionConfig {
            broadcast_enabled: false,
            broadcast_interval: Duration::from_secs(300),
            latitude: None,
            longitude: None,
            altitude: None,
        }
    }
}

/// Reconnection policy of the control loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    /// Consecutive attempts before giving up
    pub max_attempts: u32,
    /// Fixed sleep between attempts
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub backoff: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            enabled: true,
            max_attempts: 5,
            backoff: Duration::from_secs(5),
        }
    }
}

/// Batch store location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
    /// Rows fetched per page by lazy queries
    pub query_page_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            path: "master_data.db".to_string(),
            query_page_size: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Handlers accepted per event category
    pub max_handlers: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        EventConfig {
            max_handlers: super::MAX_EVENT_HANDLERS,
        }
    }
}

/// Configuration for the master controller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub security: SecurityConfig,
    pub channel: ChannelConfig,
    pub protocol: ProtocolSettings,
    pub peers: PeerConfig,
    pub position: PositionConfig,
    pub reconnect: ReconnectConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub events: EventConfig,
}

impl Config {
    /// Parses a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Config = toml::from_str(source)
            .map_err(|e| Error::config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    /// Checks cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.peers.max_peers == 0 {
            return Err(Error::config("peers.max_peers must be at least 1"));
        }
        if self.peers.offline_timeout.is_zero() {
            return Err(Error::config("peers.offline_timeout must be non-zero"));
        }
        if self.protocol.max_payload < crate::protocol::HEADER_SIZE {
            return Err(Error::config("protocol.max_payload is smaller than a frame header"));
        }
        if self.storage.query_page_size == 0 {
            return Err(Error::config("storage.query_page_size must be at least 1"));
        }
        self.security.decoded_key()?;
        Ok(())
    }

    /// Creates a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Config builder for fluent API
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Sets the expected device key (base64)
    pub fn private_key(mut self, key: impl Into<String>) -> Self {
        self.config.security.private_key = Some(key.into());
        self
    }

    /// Sets the external provisioning command
    pub fn provision_command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.security.provision_command = argv.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the transport endpoint
    pub fn device_address(mut self, address: impl Into<String>) -> Self {
        self.config.device.address = address.into();
        self
    }

    /// Sets the private channel index
    pub fn private_channel(mut self, index: u8) -> Self {
        self.config.channel.private_channel_index = index;
        self
    }

    /// Sets the private port number
    pub fn private_port(mut self, port: u16) -> Self {
        self.config.channel.private_port = port;
        self
    }

    /// Enables or disables automatic ACKs
    pub fn send_ack(mut self, enabled: bool) -> Self {
        self.config.protocol.send_ack = enabled;
        self
    }

    /// Sets the peer capacity
    pub fn max_peers(mut self, max: usize) -> Self {
        self.config.peers.max_peers = max;
        self
    }

    /// Sets the per-peer batch history capacity
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.config.peers.history_capacity = capacity;
        self
    }

    /// Sets the offline timeout
    pub fn offline_timeout(mut self, timeout: Duration) -> Self {
        self.config.peers.offline_timeout = timeout;
        self
    }

    /// Sets the liveness sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.peers.sweep_interval = interval;
        self
    }

    /// Enables periodic position broadcast from a fixed position
    pub fn fixed_position(mut self, latitude: f64, longitude: f64, altitude: i32, interval: Duration) -> Self {
        self.config.position = PositionConfig {
            broadcast_enabled: true,
            broadcast_interval: interval,
            latitude: Some(latitude),
            longitude: Some(longitude),
            altitude: Some(altitude),
        };
        self
    }

    /// Sets the reconnect policy
    pub fn reconnect(mut self, enabled: bool, max_attempts: u32, backoff: Duration) -> Self {
        self.config.reconnect = ReconnectConfig { enabled, max_attempts, backoff };
        self
    }

    /// Sets the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.device.connect_timeout = timeout;
        self
    }

    /// Sets the database path
    pub fn storage_path(mut self, path: impl Into<String>) -> Self {
        self.config.storage.path = path.into();
        self
    }

    /// Sets the handler limit per event category
    pub fn max_handlers(mut self, max: usize) -> Self {
        self.config.events.max_handlers = max;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_rejects_empty() {
        assert!(PeerId::new("").is_none());
        assert!(PeerId::new("   ").is_none());
        assert_eq!(PeerId::new("!a1b2c3d4").unwrap().as_str(), "!a1b2c3d4");
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.channel.private_port, 257);
        assert_eq!(config.channel.private_channel_index, 1);
        assert_eq!(config.peers.max_peers, 256);
        assert_eq!(config.peers.history_capacity, 50);
        assert_eq!(config.peers.offline_timeout, Duration::from_secs(600));
        assert!(config.protocol.send_ack);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let config = Config::from_toml_str(
            r#"
            [device]
            address = "/dev/ttyUSB0"
            connect_timeout = 10

            [channel]
            private_channel_index = 2

            [peers]
            max_peers = 16
            offline_timeout = 300

            [position]
            broadcast_enabled = true
            latitude = 52.52
            longitude = 13.405
            "#,
        )
        .unwrap();

        assert_eq!(config.device.address, "/dev/ttyUSB0");
        assert_eq!(config.device.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.channel.private_channel_index, 2);
        assert_eq!(config.channel.private_port, 257);
        assert_eq!(config.peers.max_peers, 16);
        assert_eq!(config.peers.offline_timeout, Duration::from_secs(300));
        assert!(config.position.broadcast_enabled);
        assert_eq!(config.position.latitude, Some(52.52));
    }

    #[test]
    fn test_config_rejects_bad_key() {
        let err = Config::from_toml_str(
            r#"
            [security]
            private_key = "not base64!!"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_config_rejects_zero_capacity() {
        let config = Config::builder().max_peers(0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = Config::builder()
            .private_key("AQIDBA==")
            .max_peers(4)
            .offline_timeout(Duration::from_secs(30))
            .send_ack(false)
            .build();

        assert_eq!(config.security.decoded_key().unwrap(), Some(vec![1, 2, 3, 4]));
        assert_eq!(config.peers.max_peers, 4);
        assert!(!config.protocol.send_ack);
    }
}
