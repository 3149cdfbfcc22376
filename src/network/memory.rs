//! In-process transport
//!
//! Stands in for the radio in tests and demos: outbound packets are recorded,
//! inbound packets are injected by the caller, and link failures can be
//! scripted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::core::{Error, PeerId, Result};
use super::connection::Provisioner;
use super::{InboundPacket, LinkHandler, ReceiveHandler, Transport};

/// A packet passed to [`Transport::send`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    pub payload: Bytes,
    /// `None` for broadcasts
    pub destination: Option<PeerId>,
    pub port: u16,
    pub channel: u8,
}

#[derive(Debug)]
struct LinkState {
    connected: bool,
    refuse_connects: u32,
    connect_attempts: u32,
    connect_delay: Duration,
    device_key: Option<Vec<u8>>,
    sent: Vec<SentPacket>,
}

/// Loopback transport with scripted behaviour
pub struct MemoryTransport {
    local_id: PeerId,
    link: Mutex<LinkState>,
    receive: RwLock<Option<ReceiveHandler>>,
    link_change: RwLock<Option<LinkHandler>>,
}

impl MemoryTransport {
    pub fn new(local_id: PeerId) -> Arc<Self> {
        Arc::new(MemoryTransport {
            local_id,
            link: Mutex::new(LinkState {
                connected: false,
                refuse_connects: 0,
                connect_attempts: 0,
                connect_delay: Duration::ZERO,
                device_key: None,
                sent: Vec::new(),
            }),
            receive: RwLock::new(None),
            link_change: RwLock::new(None),
        })
    }

    /// Sets the key the device reports
    pub fn set_device_key(&self, key: Option<Vec<u8>>) {
        self.link.lock().device_key = key;
    }

    /// Makes the next `count` connect attempts fail
    pub fn refuse_connects(&self, count: u32) {
        self.link.lock().refuse_connects = count;
    }

    /// Delays every connect attempt
    pub fn set_connect_delay(&self, delay: Duration) {
        self.link.lock().connect_delay = delay;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.link.lock().connect_attempts
    }

    /// Packets sent so far
    pub fn sent(&self) -> Vec<SentPacket> {
        self.link.lock().sent.clone()
    }

    /// Drains the sent packet log
    pub fn take_sent(&self) -> Vec<SentPacket> {
        std::mem::take(&mut self.link.lock().sent)
    }

    /// Delivers a packet as if it arrived over the air
    ///
    /// Returns false if the link is down or no handler is installed.
    pub fn inject(&self, from: &PeerId, channel: u8, port: u16, payload: impl Into<Bytes>) -> bool {
        if !self.link.lock().connected {
            return false;
        }
        let handler = self.receive.read().clone();
        match handler {
            Some(handler) => {
                handler(InboundPacket {
                    from: from.clone(),
                    channel,
                    port,
                    payload: payload.into(),
                });
                true
            }
            None => false,
        }
    }

    /// Simulates loss of the radio link
    pub fn drop_link(&self) {
        let was_connected = std::mem::replace(&mut self.link.lock().connected, false);
        if was_connected {
            debug!("Memory link dropped");
            self.notify_link(false);
        }
    }

    /// Provisioner that writes the key straight into this device
    pub fn provisioner(self: &Arc<Self>) -> MemoryProvisioner {
        MemoryProvisioner {
            transport: Arc::clone(self),
            calls: Mutex::new(0),
            accept: true,
        }
    }

    fn notify_link(&self, connected: bool) {
        let handler = self.link_change.read().clone();
        if let Some(handler) = handler {
            handler(connected);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, timeout: Duration) -> Result<PeerId> {
        let delay = {
            let mut link = self.link.lock();
            link.connect_attempts += 1;
            link.connect_delay
        };

        if !delay.is_zero() {
            tokio::time::timeout(timeout, tokio::time::sleep(delay))
                .await
                .map_err(|_| Error::transport(format!("connect timed out after {:?}", timeout)))?;
        }

        {
            let mut link = self.link.lock();
            if link.refuse_connects > 0 {
                link.refuse_connects -= 1;
                return Err(Error::transport("device refused connection"));
            }
            link.connected = true;
        }

        self.notify_link(true);
        Ok(self.local_id.clone())
    }

    fn send(&self, payload: &[u8], destination: Option<&PeerId>, port: u16, channel: u8) -> Result<()> {
        let mut link = self.link.lock();
        if !link.connected {
            return Err(Error::transport("link is down"));
        }
        link.sent.push(SentPacket {
            payload: Bytes::copy_from_slice(payload),
            destination: destination.cloned(),
            port,
            channel,
        });
        Ok(())
    }

    fn on_receive(&self, handler: ReceiveHandler) {
        *self.receive.write() = Some(handler);
    }

    fn on_connection_change(&self, handler: LinkHandler) {
        *self.link_change.write() = Some(handler);
    }

    fn local_identity(&self) -> Option<Vec<u8>> {
        let link = self.link.lock();
        if link.connected {
            link.device_key.clone()
        } else {
            None
        }
    }

    fn local_id(&self) -> Option<PeerId> {
        if self.is_connected() {
            Some(self.local_id.clone())
        } else {
            None
        }
    }

    fn is_connected(&self) -> bool {
        self.link.lock().connected
    }

    fn disconnect(&self) {
        self.link.lock().connected = false;
    }
}

/// Provisioner for [`MemoryTransport`]
pub struct MemoryProvisioner {
    transport: Arc<MemoryTransport>,
    calls: Mutex<u32>,
    accept: bool,
}

impl MemoryProvisioner {
    /// Makes provisioning report success without changing the device key
    pub fn ignoring(mut self) -> Self {
        self.accept = false;
        self
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock()
    }
}

#[async_trait]
impl Provisioner for MemoryProvisioner {
    async fn provision(&self, key: &[u8]) -> Result<()> {
        *self.calls.lock() += 1;
        if self.accept {
            self.transport.set_device_key(Some(key.to_vec()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn id(name: &str) -> PeerId {
        PeerId::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let transport = MemoryTransport::new(id("!00000001"));
        assert!(transport.send(&[1], None, 257, 1).is_err());

        let local = transport.connect(Duration::from_secs(1)).await.unwrap();
        assert_eq!(local, id("!00000001"));
        transport.send(&[1, 2], Some(&id("!00000002")), 257, 1).unwrap();

        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, Some(id("!00000002")));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_refused_connects() {
        let transport = MemoryTransport::new(id("!00000001"));
        transport.refuse_connects(2);
        assert!(transport.connect(Duration::from_secs(1)).await.is_err());
        assert!(transport.connect(Duration::from_secs(1)).await.is_err());
        assert!(transport.connect(Duration::from_secs(1)).await.is_ok());
        assert_eq!(transport.connect_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let transport = MemoryTransport::new(id("!00000001"));
        transport.set_connect_delay(Duration::from_secs(60));
        let err = transport.connect(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_inject_and_link_loss() {
        let transport = MemoryTransport::new(id("!00000001"));
        let received = Arc::new(AtomicUsize::new(0));
        let downs = Arc::new(AtomicUsize::new(0));

        let counter = received.clone();
        transport.on_receive(Arc::new(move |_packet: InboundPacket| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = downs.clone();
        transport.on_connection_change(Arc::new(move |up: bool| {
            if !up {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        assert!(!transport.inject(&id("!00000002"), 1, 257, vec![0u8]));
        transport.connect(Duration::from_secs(1)).await.unwrap();
        assert!(transport.inject(&id("!00000002"), 1, 257, vec![0u8]));

        transport.drop_link();
        transport.drop_link();
        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert_eq!(downs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_provisioner_writes_key() {
        let transport = MemoryTransport::new(id("!00000001"));
        transport.connect(Duration::from_secs(1)).await.unwrap();
        let provisioner = transport.provisioner();

        provisioner.provision(&[9, 9]).await.unwrap();
        assert_eq!(transport.local_identity(), Some(vec![9, 9]));
        assert_eq!(provisioner.calls(), 1);
    }
}
