//! Core types and traits for the mesh master controller
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod types;
pub mod serde;

pub use self::error::{Error, Result};
pub use self::types::{
    ChannelConfig,
    Config,
    ConfigBuilder,
    DeviceConfig,
    EventConfig,
    LoggingConfig,
    PeerConfig,
    PeerId,
    PositionConfig,
    ProtocolSettings,
    ReconnectConfig,
    SecurityConfig,
    StorageConfig,
};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Private application port (256-511 is the private app range)
pub const PRIVATE_PORT_NUM: u16 = 257;

/// Standard mesh port carrying position reports
pub const POSITION_PORT_NUM: u16 = 3;

/// Standard mesh port carrying device telemetry
pub const TELEMETRY_PORT_NUM: u16 = 67;

/// Default private channel index
pub const DEFAULT_PRIVATE_CHANNEL: u8 = 1;

/// Largest payload the mesh link carries in one packet
pub const MAX_PAYLOAD_SIZE: usize = 200;

/// Maximum number of peers to track
pub const MAX_PEERS: usize = 256;

/// Maximum data batches kept per peer
pub const MAX_DATA_BATCHES: usize = 50;

/// Maximum handlers per event category
pub const MAX_EVENT_HANDLERS: usize = 32;

/// Seconds without traffic before a peer is marked offline
pub const DEFAULT_OFFLINE_TIMEOUT_SECS: u64 = 600;
