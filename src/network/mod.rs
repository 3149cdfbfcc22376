//! Mesh link access and peer tracking
//!
//! The controller talks to the radio only through [`Transport`]. Adapters
//! deliver inbound packets through a callback and report link state changes
//! through another.

mod connection;
mod memory;
mod registry;
mod udp;

pub use self::connection::{establish, verify_identity, CommandProvisioner, Provisioner};
pub use self::memory::{MemoryProvisioner, MemoryTransport, SentPacket};
pub use self::registry::{
    BatchSummary, PeerEntry, PeerRegistry, PeerSnapshot, RegistryStats, SharedRegistry,
};
pub use self::udp::{Datagram, UdpTransport};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::core::{PeerId, Result};

/// A packet handed up by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    /// Mesh identity of the sender
    pub from: PeerId,
    /// Channel index the packet arrived on
    pub channel: u8,
    /// Application port number
    pub port: u16,
    pub payload: Bytes,
}

/// Callback for inbound packets
pub type ReceiveHandler = Arc<dyn Fn(InboundPacket) + Send + Sync>;

/// Callback for link up/down changes
pub type LinkHandler = Arc<dyn Fn(bool) + Send + Sync>;

/// Narrow interface to the mesh radio
///
/// `send` queues without blocking; `connect` is bounded by its timeout.
/// Handlers may be invoked from any task.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the link and returns the local node identity
    async fn connect(&self, timeout: Duration) -> Result<PeerId>;

    /// Sends a payload; `None` broadcasts
    fn send(&self, payload: &[u8], destination: Option<&PeerId>, port: u16, channel: u8) -> Result<()>;

    /// Installs the inbound packet callback, replacing any previous one
    fn on_receive(&self, handler: ReceiveHandler);

    /// Installs the link state callback, replacing any previous one
    fn on_connection_change(&self, handler: LinkHandler);

    /// Private key reported by the device, if connected
    fn local_identity(&self) -> Option<Vec<u8>>;

    /// Node id of the local device, if connected
    fn local_id(&self) -> Option<PeerId>;

    fn is_connected(&self) -> bool;

    /// Closes the link; safe to call repeatedly
    fn disconnect(&self);
}
