//! Mesh Master: controller for field devices on a private mesh radio channel
//!
//! Peers send fixed-size record batches, status reports and telemetry in a
//! compact binary frame on a private channel. This library decodes that
//! traffic, tracks peer liveness, persists timestamped records and answers
//! with acknowledgements and commands.
pub mod core;
pub mod controller;
pub mod network;
pub mod protocol;
pub mod storage;
pub mod util;

// Re-export commonly used items
pub use crate::core::{Config, Error, PeerId, Result};
pub use crate::controller::{ControllerStats, MasterController};
pub use crate::network::{MemoryTransport, Transport, UdpTransport};
pub use crate::protocol::{CommandType, ControllerState, MessageType, ProtocolMessage};
pub use crate::storage::{BatchStore, SqliteStore, StoredRecord, TimeRange};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
