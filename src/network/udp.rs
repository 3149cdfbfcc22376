//! UDP gateway transport
//!
//! Talks to a mesh gateway that relays radio packets as bincode-encoded
//! datagrams. The gateway answers `Hello` with `Welcome`, carrying the
//! radio's node id and key, and may close the link with `Bye`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Serialize, Deserialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tokio_util::udp::UdpFramed;
use tracing::{debug, error, info, warn};

use crate::core::{Error, PeerId, Result};
use super::{InboundPacket, LinkHandler, ReceiveHandler, Transport};

/// Envelope exchanged with the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datagram {
    /// Session request from the controller
    Hello,
    /// Session accepted by the gateway
    Welcome {
        node_id: String,
        private_key: Option<Vec<u8>>,
    },
    /// A radio packet; `to` is `None` for broadcasts
    Packet {
        from: String,
        to: Option<String>,
        channel: u8,
        port: u16,
        payload: Vec<u8>,
    },
    /// Session closed by the gateway
    Bye,
}

/// bincode codec, one envelope per datagram
#[derive(Debug, Clone, Copy, Default)]
pub struct DatagramCodec;

impl Decoder for DatagramCodec {
    type Item = Datagram;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }
        // Consume the whole datagram even if it fails to decode
        let data = src.split();
        bincode::deserialize(&data)
            .map(Some)
            .map_err(|e| Error::transport(format!("undecodable datagram: {}", e)))
    }
}

impl Encoder<Datagram> for DatagramCodec {
    type Error = Error;

    fn encode(&mut self, item: Datagram, dst: &mut BytesMut) -> Result<()> {
        bincode::serialize_into(dst.writer(), &item)
            .map_err(|e| Error::transport(format!("failed to encode datagram: {}", e)))
    }
}

type FramedSink = SplitSink<UdpFramed<DatagramCodec>, (Datagram, SocketAddr)>;
type FramedStream = SplitStream<UdpFramed<DatagramCodec>>;

#[derive(Default)]
struct Handlers {
    receive: RwLock<Option<ReceiveHandler>>,
    link: RwLock<Option<LinkHandler>>,
    connected: AtomicBool,
}

impl Handlers {
    fn link_lost(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!(reason, "Gateway link lost");
            let handler = self.link.read().clone();
            if let Some(handler) = handler {
                handler(false);
            }
        }
    }
}

struct Session {
    local_id: PeerId,
    private_key: Option<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Datagram>,
    cancel: CancellationToken,
}

/// Transport that reaches the radio through a UDP gateway
pub struct UdpTransport {
    bind: SocketAddr,
    gateway: SocketAddr,
    handlers: Arc<Handlers>,
    session: Mutex<Option<Session>>,
}

fn bind_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

impl UdpTransport {
    pub fn new(bind: SocketAddr, gateway: SocketAddr) -> Arc<Self> {
        Arc::new(UdpTransport {
            bind,
            gateway,
            handlers: Arc::new(Handlers::default()),
            session: Mutex::new(None),
        })
    }

    /// Parses `bind` and `gateway` socket addresses
    pub fn from_addresses(bind: &str, gateway: &str) -> Result<Arc<Self>> {
        let bind = bind
            .parse()
            .map_err(|e| Error::config(format!("invalid bind address {:?}: {}", bind, e)))?;
        let gateway = gateway
            .parse()
            .map_err(|e| Error::config(format!("invalid gateway address {:?}: {}", gateway, e)))?;
        Ok(Self::new(bind, gateway))
    }

    async fn handshake(framed: &mut UdpFramed<DatagramCodec>, gateway: SocketAddr) -> Result<(String, Option<Vec<u8>>)> {
        framed.send((Datagram::Hello, gateway)).await?;
        loop {
            match framed.next().await {
                Some(Ok((Datagram::Welcome { node_id, private_key }, _))) => {
                    return Ok((node_id, private_key));
                }
                Some(Ok((other, addr))) => {
                    debug!(from = %addr, datagram = ?other, "Ignoring datagram during handshake");
                }
                Some(Err(Error::Io(e))) => return Err(Error::Io(e)),
                Some(Err(e)) => debug!(error = %e, "Bad datagram during handshake"),
                None => return Err(Error::transport("gateway socket closed")),
            }
        }
    }

    async fn write_loop(
        mut sink: FramedSink,
        mut outbound: mpsc::UnboundedReceiver<Datagram>,
        gateway: SocketAddr,
        handlers: Arc<Handlers>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = outbound.recv() => {
                    let datagram = match next {
                        Some(datagram) => datagram,
                        None => break,
                    };
                    if let Err(e) = sink.send((datagram, gateway)).await {
                        error!(error = %e, "Failed to send datagram");
                        if matches!(e, Error::Io(_)) {
                            handlers.link_lost("send failed");
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn read_loop(
        mut stream: FramedStream,
        local_id: PeerId,
        handlers: Arc<Handlers>,
        cancel: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok((Datagram::Packet { from, to, channel, port, payload }, _))) => {
                    if let Some(to) = to {
                        if to != local_id.as_str() {
                            continue;
                        }
                    }
                    let from = match PeerId::new(from) {
                        Some(from) => from,
                        None => {
                            debug!("Dropping packet without sender");
                            continue;
                        }
                    };
                    let handler = handlers.receive.read().clone();
                    if let Some(handler) = handler {
                        handler(InboundPacket { from, channel, port, payload: Bytes::from(payload) });
                    }
                }
                Some(Ok((Datagram::Bye, _))) => {
                    handlers.link_lost("gateway closed the session");
                    cancel.cancel();
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(Error::Io(e))) => {
                    handlers.link_lost(&e.to_string());
                    cancel.cancel();
                    break;
                }
                Some(Err(e)) => warn!(error = %e, "Dropping datagram"),
                None => {
                    handlers.link_lost("socket closed");
                    cancel.cancel();
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn connect(&self, timeout: Duration) -> Result<PeerId> {
        self.disconnect();

        let socket = bind_socket(self.bind)?;
        let mut framed = UdpFramed::new(socket, DatagramCodec);
        let (node_id, private_key) = tokio::time::timeout(timeout, Self::handshake(&mut framed, self.gateway))
            .await
            .map_err(|_| Error::transport(format!("gateway {} did not answer within {:?}", self.gateway, timeout)))??;
        let local_id = PeerId::new(node_id).ok_or_else(|| Error::transport("gateway reported an empty node id"))?;

        let (sink, stream) = framed.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(Self::write_loop(sink, outbound_rx, self.gateway, self.handlers.clone(), cancel.clone()));
        tokio::spawn(Self::read_loop(stream, local_id.clone(), self.handlers.clone(), cancel.clone()));

        *self.session.lock() = Some(Session {
            local_id: local_id.clone(),
            private_key,
            outbound,
            cancel,
        });
        self.handlers.connected.store(true, Ordering::SeqCst);
        info!(gateway = %self.gateway, node = %local_id, "Gateway session established");

        let handler = self.handlers.link.read().clone();
        if let Some(handler) = handler {
            handler(true);
        }
        Ok(local_id)
    }

    fn send(&self, payload: &[u8], destination: Option<&PeerId>, port: u16, channel: u8) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::transport("gateway link is down"));
        }
        let session = self.session.lock();
        let session = session.as_ref().ok_or_else(|| Error::transport("not connected"))?;
        session
            .outbound
            .send(Datagram::Packet {
                from: session.local_id.as_str().to_string(),
                to: destination.map(|d| d.as_str().to_string()),
                channel,
                port,
                payload: payload.to_vec(),
            })
            .map_err(|_| Error::transport("gateway writer stopped"))
    }

    fn on_receive(&self, handler: ReceiveHandler) {
        *self.handlers.receive.write() = Some(handler);
    }

    fn on_connection_change(&self, handler: LinkHandler) {
        *self.handlers.link.write() = Some(handler);
    }

    fn local_identity(&self) -> Option<Vec<u8>> {
        self.session.lock().as_ref().and_then(|s| s.private_key.clone())
    }

    fn local_id(&self) -> Option<PeerId> {
        self.session.lock().as_ref().map(|s| s.local_id.clone())
    }

    fn is_connected(&self) -> bool {
        self.handlers.connected.load(Ordering::SeqCst)
    }

    fn disconnect(&self) {
        if let Some(session) = self.session.lock().take() {
            session.cancel.cancel();
            debug!(gateway = %self.gateway, "Gateway session closed");
        }
        self.handlers.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    async fn gateway() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    async fn recv(socket: &UdpSocket) -> (Datagram, SocketAddr) {
        let mut buf = vec![0u8; 2048];
        let (len, from) = socket.recv_from(&mut buf).await.unwrap();
        (bincode::deserialize(&buf[..len]).unwrap(), from)
    }

    async fn reply(socket: &UdpSocket, to: SocketAddr, datagram: &Datagram) {
        socket.send_to(&bincode::serialize(datagram).unwrap(), to).await.unwrap();
    }

    #[test]
    fn test_codec_consumes_bad_datagram() {
        let mut codec = DatagramCodec;
        let mut buf = BytesMut::from(&[0xFFu8, 0xFF, 0xFF, 0xFF, 0xFF][..]);
        assert!(codec.decode(&mut buf).is_err());
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let mut out = BytesMut::new();
        codec.encode(Datagram::Hello, &mut out).unwrap();
        assert_eq!(codec.decode(&mut out).unwrap(), Some(Datagram::Hello));
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (gw, gw_addr) = gateway().await;
        let transport = UdpTransport::new("127.0.0.1:0".parse().unwrap(), gw_addr);

        let (seen_tx, mut seen_rx) = unbounded_channel();
        transport.on_receive(Arc::new(move |packet: InboundPacket| {
            let _ = seen_tx.send(packet);
        }));

        let connect = tokio::spawn({
            let transport = transport.clone();
            async move { transport.connect(Duration::from_secs(5)).await }
        });

        let (hello, client) = recv(&gw).await;
        assert_eq!(hello, Datagram::Hello);
        reply(&gw, client, &Datagram::Welcome {
            node_id: "!0000cafe".into(),
            private_key: Some(vec![1, 2, 3]),
        })
        .await;

        let local = connect.await.unwrap().unwrap();
        assert_eq!(local.as_str(), "!0000cafe");
        assert_eq!(transport.local_identity(), Some(vec![1, 2, 3]));

        reply(&gw, client, &Datagram::Packet {
            from: "!00000042".into(),
            to: None,
            channel: 1,
            port: 257,
            payload: vec![0xFF, 0x00, 0x00, 0x00],
        })
        .await;
        let packet = seen_rx.recv().await.unwrap();
        assert_eq!(packet.from.as_str(), "!00000042");
        assert_eq!(packet.port, 257);

        let dest = PeerId::new("!00000042").unwrap();
        transport.send(&[0x12, 0x00, 0x00, 0x00], Some(&dest), 257, 1).unwrap();
        let (sent, _) = recv(&gw).await;
        assert_eq!(
            sent,
            Datagram::Packet {
                from: "!0000cafe".into(),
                to: Some("!00000042".into()),
                channel: 1,
                port: 257,
                payload: vec![0x12, 0x00, 0x00, 0x00],
            }
        );

        transport.disconnect();
        assert!(transport.send(&[0], None, 257, 1).is_err());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (_gw, gw_addr) = gateway().await;
        let transport = UdpTransport::new("127.0.0.1:0".parse().unwrap(), gw_addr);
        let err = transport.connect(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_bye_reports_link_loss() {
        let (gw, gw_addr) = gateway().await;
        let transport = UdpTransport::new("127.0.0.1:0".parse().unwrap(), gw_addr);
        let (link_tx, mut link_rx) = unbounded_channel();
        transport.on_connection_change(Arc::new(move |up: bool| {
            let _ = link_tx.send(up);
        }));

        let connect = tokio::spawn({
            let transport = transport.clone();
            async move { transport.connect(Duration::from_secs(5)).await }
        });
        let (_, client) = recv(&gw).await;
        reply(&gw, client, &Datagram::Welcome { node_id: "!00000001".into(), private_key: None }).await;
        connect.await.unwrap().unwrap();
        assert_eq!(link_rx.recv().await, Some(true));

        reply(&gw, client, &Datagram::Bye).await;
        assert_eq!(link_rx.recv().await, Some(false));
        assert!(!transport.is_connected());
    }
}
