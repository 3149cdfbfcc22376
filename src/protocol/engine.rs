//! Protocol engine
//!
//! Inbound packets are decoded, classified and applied to the peer registry
//! and the record store before observers are notified and an ACK is sent.
//! Outbound helpers encode master messages and are refused unless the
//! controller is ready.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::core::{Config, Error, PeerId, Result, POSITION_PORT_NUM, TELEMETRY_PORT_NUM};
use crate::network::{InboundPacket, SharedRegistry, Transport};
use crate::storage::BatchStore;
use crate::util::unix_now;
use super::batch::{Batch, DataBatch, TimestampedBatch};
use super::codec::{decode_frame, encode_frame};
use super::events::{BatchEvent, EventHub, StatusEvent, TelemetryEvent};
use super::message::{
    AckPayload, CommandType, MasterCommand, MessageFlags, MessageType, PositionReport,
    ProtocolMessage, SlaveStatusReport,
};
use super::state::StateMachine;

/// Typed content of an inbound frame
#[derive(Debug)]
enum Inbound {
    Batch(Batch),
    Status(SlaveStatusReport),
    Telemetry(Bytes),
    Heartbeat,
    SlaveAck,
    /// Master-bound request or command echoed back onto the channel
    Request(MessageType),
    Unknown(u8),
}

impl Inbound {
    fn parse(message: &ProtocolMessage) -> Result<Self> {
        Ok(match message.msg_type {
            MessageType::DataBatch => Inbound::Batch(Batch::Plain(DataBatch::decode(&message.payload)?)),
            MessageType::TimestampedBatch => {
                Inbound::Batch(Batch::Timestamped(TimestampedBatch::decode(&message.payload)?))
            }
            MessageType::Status => Inbound::Status(SlaveStatusReport::decode(&message.payload)?),
            MessageType::Telemetry => Inbound::Telemetry(message.payload.clone()),
            MessageType::Heartbeat => Inbound::Heartbeat,
            MessageType::SlaveAck => Inbound::SlaveAck,
            MessageType::RequestStatus
            | MessageType::RequestData
            | MessageType::Command
            | MessageType::Config
            | MessageType::MasterAck => Inbound::Request(message.msg_type),
            MessageType::Unknown(raw) => Inbound::Unknown(raw),
        })
    }
}

/// Frame counters
#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    dropped: AtomicU64,
    acks_sent: AtomicU64,
    sent: AtomicU64,
}

/// Snapshot of engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Private-port frames handed to dispatch
    pub frames_received: u64,
    /// Frames dropped as malformed or from rejected peers
    pub frames_dropped: u64,
    pub acks_sent: u64,
    /// Outbound messages accepted by the transport, ACKs excluded
    pub messages_sent: u64,
}

/// Dispatches inbound frames and encodes outbound ones
pub struct ProtocolEngine {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    registry: SharedRegistry,
    store: Arc<dyn BatchStore>,
    events: Arc<EventHub>,
    state: Arc<StateMachine>,
    local_id: RwLock<Option<PeerId>>,
    counters: Counters,
}

impl ProtocolEngine {
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        registry: SharedRegistry,
        store: Arc<dyn BatchStore>,
        events: Arc<EventHub>,
        state: Arc<StateMachine>,
    ) -> Self {
        ProtocolEngine {
            config,
            transport,
            registry,
            store,
            events,
            state,
            local_id: RwLock::new(None),
            counters: Counters::default(),
        }
    }

    /// Records the local node id so our own echoes are ignored
    pub fn set_local_id(&self, id: Option<PeerId>) {
        *self.local_id.write() = id;
    }

    pub fn local_id(&self) -> Option<PeerId> {
        self.local_id.read().clone()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            frames_received: self.counters.received.load(Ordering::Relaxed),
            frames_dropped: self.counters.dropped.load(Ordering::Relaxed),
            acks_sent: self.counters.acks_sent.load(Ordering::Relaxed),
            messages_sent: self.counters.sent.load(Ordering::Relaxed),
        }
    }

    /// Entry point for the transport's receive callback
    ///
    /// Never fails: every problem is logged and the packet dropped.
    pub fn handle_packet(&self, packet: InboundPacket) {
        let channel = &self.config.channel;
        if packet.channel != channel.private_channel_index {
            trace!(channel = packet.channel, "Ignoring packet on public channel");
            return;
        }
        if self.local_id.read().as_ref() == Some(&packet.from) {
            return;
        }

        let now = unix_now();
        if packet.port != channel.private_port {
            self.handle_other_traffic(packet, now);
            return;
        }

        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let message = match decode_frame(&packet.payload) {
            Ok((message, _)) => message,
            Err(e) => {
                self.drop_malformed(&packet.from, &e);
                return;
            }
        };
        self.dispatch(&packet.from, message, now);
    }

    fn drop_malformed(&self, from: &PeerId, error: &Error) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        let known = self.registry.lock().record_error(from);
        if error.is_decode_error() {
            warn!(peer = %from, known, error = %error, "Dropping malformed frame");
        } else {
            error!(peer = %from, known, error = %error, "Dropping undecodable frame");
        }
    }

    fn dispatch(&self, from: &PeerId, message: ProtocolMessage, now: u64) {
        debug!(
            peer = %from,
            msg_type = %message.msg_type,
            flags = message.flags.bits(),
            len = message.payload.len(),
            "Protocol message"
        );

        let inbound = match Inbound::parse(&message) {
            Ok(inbound) => inbound,
            Err(e) => {
                self.drop_malformed(from, &e);
                return;
            }
        };

        {
            let mut registry = self.registry.lock();
            if registry.get_or_create(from, now).is_none() {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            registry.touch(from, now);
            match &inbound {
                Inbound::Status(report) => {
                    registry.record_status(from, report.clone());
                }
                Inbound::Telemetry(_) => {
                    registry.record_telemetry(from);
                }
                _ => {}
            }
        }

        let mut batch_id = None;
        match inbound {
            Inbound::Batch(batch) => {
                batch_id = Some(batch.batch_id());
                // A failed write stays out of history and gets no ACK
                let stored = match self.persist(from, &batch, now) {
                    Ok(stored) => stored,
                    Err(_) => return,
                };
                let recorded = self.registry.lock().record_batch(from, batch.clone());
                if recorded {
                    info!(
                        peer = %from,
                        batch_id = batch.batch_id(),
                        records = batch.record_count(),
                        stored,
                        "Received batch"
                    );
                    self.events.batches.emit(&BatchEvent {
                        peer: from.clone(),
                        batch,
                        received_at: now,
                        stored,
                    });
                }
            }
            Inbound::Status(report) => {
                info!(
                    peer = %from,
                    status = ?report.status,
                    battery = report.battery_percent,
                    pending = report.pending_data_bytes,
                    "Status report"
                );
                self.events.statuses.emit(&StatusEvent {
                    peer: from.clone(),
                    report,
                    received_at: now,
                });
            }
            Inbound::Telemetry(payload) => {
                self.events.telemetry.emit(&TelemetryEvent {
                    peer: from.clone(),
                    port: self.config.channel.private_port,
                    payload,
                    received_at: now,
                });
            }
            Inbound::Heartbeat => debug!(peer = %from, "Heartbeat"),
            Inbound::SlaveAck => debug!(peer = %from, "ACK from peer"),
            Inbound::Request(kind) => debug!(peer = %from, msg_type = %kind, "Ignoring master-bound message"),
            Inbound::Unknown(raw) => debug!(peer = %from, msg_type = raw, "Unknown message type"),
        }

        if message.ack_requested() && self.config.protocol.send_ack {
            self.send_ack(from, message.msg_type, batch_id);
        }
    }

    fn persist(&self, from: &PeerId, batch: &Batch, now: u64) -> Result<usize> {
        let batch = match batch {
            Batch::Timestamped(batch) => batch,
            Batch::Plain(_) => return Ok(0),
        };
        if !batch.is_monotonic() {
            debug!(peer = %from, batch_id = batch.batch_id, "Batch offsets decrease");
        }
        self.store
            .store_batch(from, batch.batch_id, now, &batch.to_storage_format())
            .map_err(|e| {
                error!(peer = %from, batch_id = batch.batch_id, error = %e, "Failed to store batch");
                e
            })
    }

    /// Non-protocol traffic on the private channel still proves liveness
    fn handle_other_traffic(&self, packet: InboundPacket, now: u64) {
        let is_telemetry = packet.port == TELEMETRY_PORT_NUM;
        {
            let mut registry = self.registry.lock();
            if registry.get_or_create(&packet.from, now).is_none() {
                return;
            }
            registry.touch(&packet.from, now);
            if is_telemetry {
                registry.record_telemetry(&packet.from);
            }
        }

        if is_telemetry {
            debug!(peer = %packet.from, len = packet.payload.len(), "Standard telemetry");
            self.events.telemetry.emit(&TelemetryEvent {
                peer: packet.from,
                port: packet.port,
                payload: packet.payload,
                received_at: now,
            });
        } else {
            trace!(peer = %packet.from, port = packet.port, "Other traffic on private channel");
        }
    }

    /// Runs a liveness sweep and notifies offline observers
    ///
    /// Returns the number of peers that went offline.
    pub fn sweep(&self, now: u64) -> usize {
        let timeout = self.config.peers.offline_timeout.as_secs();
        let offline = self.registry.lock().sweep(now, timeout);
        for event in &offline {
            self.events.peer_offline.emit(event);
        }
        offline.len()
    }

    /// ACKs go to the exact sender, never to broadcast
    fn send_ack(&self, to: &PeerId, acked: MessageType, batch_id: Option<u32>) {
        let ack = ProtocolMessage::new(MessageType::MasterAck, AckPayload { acked, batch_id }.encode());
        let result = encode_frame(&ack).and_then(|frame| {
            self.transport.send(
                &frame,
                Some(to),
                self.config.channel.private_port,
                self.config.channel.private_channel_index,
            )
        });

        match result {
            Ok(()) => {
                self.counters.acks_sent.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %to, acked = %acked, batch_id, "ACK sent");
            }
            Err(e) => error!(peer = %to, error = %e, "Failed to send ACK"),
        }
    }

    fn send_message(&self, message: &ProtocolMessage, destination: Option<&PeerId>) -> Result<()> {
        self.state.ensure_ready()?;

        let max = self.config.protocol.max_payload;
        let size = message.payload.len();
        if size > max {
            return Err(Error::PayloadTooLarge { size, max });
        }
        let frame = encode_frame(message)?;

        let channel = &self.config.channel;
        self.transport
            .send(&frame, destination, channel.private_port, channel.private_channel_index)?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Sends a command to one peer
    pub fn send_command(&self, destination: &PeerId, command: CommandType, params: Vec<Bytes>) -> Result<()> {
        self.state.ensure_ready()?;
        let payload = MasterCommand::new(command, params).encode()?;
        self.send_message(&ProtocolMessage::new(MessageType::Command, payload), Some(destination))?;
        info!(peer = %destination, command = ?command, "Command sent");
        Ok(())
    }

    /// Sends a command to every peer
    pub fn broadcast_command(&self, command: CommandType, params: Vec<Bytes>) -> Result<()> {
        self.state.ensure_ready()?;
        let payload = MasterCommand::new(command, params).encode()?;
        self.send_message(&ProtocolMessage::new(MessageType::Command, payload), None)?;
        info!(command = ?command, "Command broadcast");
        Ok(())
    }

    /// Asks a peer for a status report; the reply arrives as a STATUS frame
    pub fn request_status(&self, destination: &PeerId) -> Result<()> {
        let message = ProtocolMessage::empty(MessageType::RequestStatus).with_flags(MessageFlags::ACK_REQUESTED);
        self.send_message(&message, Some(destination))?;
        info!(peer = %destination, "Status request sent");
        Ok(())
    }

    /// Asks a peer to flush its pending batches
    pub fn request_data(&self, destination: &PeerId) -> Result<()> {
        let message = ProtocolMessage::empty(MessageType::RequestData).with_flags(MessageFlags::ACK_REQUESTED);
        self.send_message(&message, Some(destination))?;
        info!(peer = %destination, "Data request sent");
        Ok(())
    }

    pub fn send_heartbeat(&self, destination: Option<&PeerId>) -> Result<()> {
        self.send_message(&ProtocolMessage::empty(MessageType::Heartbeat), destination)
    }

    /// Broadcasts a position on the private channel
    ///
    /// Missing coordinates fall back to the configured fixed position.
    pub fn send_position(&self, latitude: Option<f64>, longitude: Option<f64>, altitude: Option<i32>) -> Result<()> {
        self.state.ensure_ready()?;

        let fixed = &self.config.position;
        let (latitude, longitude) = match (latitude.or(fixed.latitude), longitude.or(fixed.longitude)) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => return Err(Error::config("no position available")),
        };
        let report = PositionReport {
            latitude,
            longitude,
            altitude: altitude.or(fixed.altitude).unwrap_or(0),
        };

        let max = self.config.protocol.max_payload;
        let payload = report.encode();
        if payload.len() > max {
            return Err(Error::PayloadTooLarge { size: payload.len(), max });
        }
        self.transport
            .send(&payload, None, POSITION_PORT_NUM, self.config.channel.private_channel_index)?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);

        info!(
            channel = self.config.channel.private_channel_index,
            latitude,
            longitude,
            altitude = report.altitude,
            "Position broadcast"
        );
        Ok(())
    }
}
