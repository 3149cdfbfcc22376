use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Serialize, Deserialize};

use crate::core::{Error, Result};

/// Protocol message types
///
/// Values not in the catalogue decode to [`MessageType::Unknown`] and keep
/// their raw byte, so every header round-trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Peer -> master
    Telemetry,
    DataBatch,
    Status,
    SlaveAck,
    TimestampedBatch,

    // Master -> peer
    Command,
    Config,
    MasterAck,
    RequestStatus,
    RequestData,

    // Bidirectional
    Heartbeat,

    /// Type byte outside the catalogue
    Unknown(u8),
}

impl MessageType {
    /// Returns the wire value
    pub fn as_u8(self) -> u8 {
        match self {
            MessageType::Telemetry => 0x01,
            MessageType::DataBatch => 0x02,
            MessageType::Status => 0x03,
            MessageType::SlaveAck => 0x04,
            MessageType::TimestampedBatch => 0x05,
            MessageType::Command => 0x10,
            MessageType::Config => 0x11,
            MessageType::MasterAck => 0x12,
            MessageType::RequestStatus => 0x13,
            MessageType::RequestData => 0x14,
            MessageType::Heartbeat => 0xFF,
            MessageType::Unknown(raw) => raw,
        }
    }
}

impl From<u8> for MessageType {
    fn from(raw: u8) -> Self {
        match raw {
            0x01 => MessageType::Telemetry,
            0x02 => MessageType::DataBatch,
            0x03 => MessageType::Status,
            0x04 => MessageType::SlaveAck,
            0x05 => MessageType::TimestampedBatch,
            0x10 => MessageType::Command,
            0x11 => MessageType::Config,
            0x12 => MessageType::MasterAck,
            0x13 => MessageType::RequestStatus,
            0x14 => MessageType::RequestData,
            0xFF => MessageType::Heartbeat,
            other => MessageType::Unknown(other),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Telemetry => f.write_str("TELEMETRY"),
            MessageType::DataBatch => f.write_str("DATA_BATCH"),
            MessageType::Status => f.write_str("STATUS"),
            MessageType::SlaveAck => f.write_str("SLAVE_ACK"),
            MessageType::TimestampedBatch => f.write_str("TIMESTAMPED_BATCH"),
            MessageType::Command => f.write_str("COMMAND"),
            MessageType::Config => f.write_str("CONFIG"),
            MessageType::MasterAck => f.write_str("MASTER_ACK"),
            MessageType::RequestStatus => f.write_str("REQUEST_STATUS"),
            MessageType::RequestData => f.write_str("REQUEST_DATA"),
            MessageType::Heartbeat => f.write_str("HEARTBEAT"),
            MessageType::Unknown(raw) => write!(f, "UNKNOWN({:#04x})", raw),
        }
    }
}

/// Header flag bitmask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageFlags(pub u8);

impl MessageFlags {
    pub const NONE: MessageFlags = MessageFlags(0x00);
    /// Sender wants an acknowledgment
    pub const ACK_REQUESTED: MessageFlags = MessageFlags(0x01);
    /// Part of a larger message
    pub const FRAGMENTED: MessageFlags = MessageFlags(0x02);
    /// Last fragment of a fragmented message
    pub const LAST_FRAGMENT: MessageFlags = MessageFlags(0x04);

    /// Returns true if every bit of `other` is set
    pub fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the raw bitmask
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for MessageFlags {
    type Output = MessageFlags;

    fn bitor(self, rhs: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | rhs.0)
    }
}

/// A decoded protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub msg_type: MessageType,
    pub flags: MessageFlags,
    pub payload: Bytes,
}

impl ProtocolMessage {
    /// Creates a message without flags
    pub fn new(msg_type: MessageType, payload: impl Into<Bytes>) -> Self {
        ProtocolMessage {
            msg_type,
            flags: MessageFlags::NONE,
            payload: payload.into(),
        }
    }

    /// Creates a message with an empty payload
    pub fn empty(msg_type: MessageType) -> Self {
        Self::new(msg_type, Bytes::new())
    }

    /// Sets the header flags
    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Returns true if the sender asked for an ACK
    pub fn ack_requested(&self) -> bool {
        self.flags.contains(MessageFlags::ACK_REQUESTED)
    }
}

/// Master command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    Reboot,
    Sleep,
    Wake,
    SetInterval,
    ClearData,
    SendData,
    SetMode,
    Unknown(u8),
}

impl CommandType {
    /// Returns the wire value
    pub fn as_u8(self) -> u8 {
        match self {
            CommandType::Reboot => 0x01,
            CommandType::Sleep => 0x02,
            CommandType::Wake => 0x03,
            CommandType::SetInterval => 0x04,
            CommandType::ClearData => 0x05,
            CommandType::SendData => 0x06,
            CommandType::SetMode => 0x07,
            CommandType::Unknown(raw) => raw,
        }
    }
}

impl From<u8> for CommandType {
    fn from(raw: u8) -> Self {
        match raw {
            0x01 => CommandType::Reboot,
            0x02 => CommandType::Sleep,
            0x03 => CommandType::Wake,
            0x04 => CommandType::SetInterval,
            0x05 => CommandType::ClearData,
            0x06 => CommandType::SendData,
            0x07 => CommandType::SetMode,
            other => CommandType::Unknown(other),
        }
    }
}

impl std::str::FromStr for CommandType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reboot" => Ok(CommandType::Reboot),
            "sleep" => Ok(CommandType::Sleep),
            "wake" => Ok(CommandType::Wake),
            "set_interval" => Ok(CommandType::SetInterval),
            "clear_data" => Ok(CommandType::ClearData),
            "send_data" => Ok(CommandType::SendData),
            "set_mode" => Ok(CommandType::SetMode),
            other => Err(Error::config(format!("unknown command: {}", other))),
        }
    }
}

/// Command from master to peer
///
/// Wire format: `[command:1][param_count:1]` then `[len:1][bytes]` per parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterCommand {
    pub command: CommandType,
    pub params: Vec<Bytes>,
}

impl MasterCommand {
    pub fn new(command: CommandType, params: Vec<Bytes>) -> Self {
        MasterCommand { command, params }
    }

    /// Encodes the command payload
    pub fn encode(&self) -> Result<Bytes> {
        if self.params.len() > u8::MAX as usize {
            return Err(Error::PayloadTooLarge { size: self.params.len(), max: u8::MAX as usize });
        }

        let body: usize = self.params.iter().map(|p| p.len() + 1).sum();
        let mut buf = BytesMut::with_capacity(2 + body);
        buf.put_u8(self.command.as_u8());
        buf.put_u8(self.params.len() as u8);
        for param in &self.params {
            if param.len() > u8::MAX as usize {
                return Err(Error::PayloadTooLarge { size: param.len(), max: u8::MAX as usize });
            }
            buf.put_u8(param.len() as u8);
            buf.extend_from_slice(param);
        }
        Ok(buf.freeze())
    }

    /// Decodes a command payload
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::malformed("command payload shorter than 2 bytes"));
        }
        let command = CommandType::from(data.get_u8());
        let count = data.get_u8() as usize;

        let mut params = Vec::with_capacity(count);
        for index in 0..count {
            if !data.has_remaining() {
                return Err(Error::malformed(format!("command parameter {} missing", index)));
            }
            let len = data.get_u8() as usize;
            if data.remaining() < len {
                return Err(Error::malformed(format!("command parameter {} truncated", index)));
            }
            params.push(data.copy_to_bytes(len));
        }

        Ok(MasterCommand { command, params })
    }
}

/// Peer status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlaveStatus {
    Ok,
    LowBattery,
    SensorError,
    MemoryFull,
    Error,
    Unknown(u8),
}

impl From<u8> for SlaveStatus {
    fn from(raw: u8) -> Self {
        match raw {
            0x00 => SlaveStatus::Ok,
            0x01 => SlaveStatus::LowBattery,
            0x02 => SlaveStatus::SensorError,
            0x03 => SlaveStatus::MemoryFull,
            0xFF => SlaveStatus::Error,
            other => SlaveStatus::Unknown(other),
        }
    }
}

impl SlaveStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            SlaveStatus::Ok => 0x00,
            SlaveStatus::LowBattery => 0x01,
            SlaveStatus::SensorError => 0x02,
            SlaveStatus::MemoryFull => 0x03,
            SlaveStatus::Error => 0xFF,
            SlaveStatus::Unknown(raw) => raw,
        }
    }
}

/// Health report sent by a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveStatusReport {
    /// Seconds since peer boot
    pub uptime: u32,
    pub status: SlaveStatus,
    pub battery_percent: u8,
    pub voltage_mv: u16,
    pub free_heap_kb: u16,
    pub free_fram_kb: u16,
    pub total_fram_kb: u16,
    pub free_flash_kb: u16,
    pub total_flash_kb: u16,
    /// Bytes queued on the peer awaiting transmission
    pub pending_data_bytes: u16,
    pub error_count: u16,
}

impl SlaveStatusReport {
    /// Encoded size in bytes
    pub const SIZE: usize = 22;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32_le(self.uptime);
        buf.put_u8(self.status.as_u8());
        buf.put_u8(self.battery_percent);
        buf.put_u16_le(self.voltage_mv);
        buf.put_u16_le(self.free_heap_kb);
        buf.put_u16_le(self.free_fram_kb);
        buf.put_u16_le(self.total_fram_kb);
        buf.put_u16_le(self.free_flash_kb);
        buf.put_u16_le(self.total_flash_kb);
        buf.put_u16_le(self.pending_data_bytes);
        buf.put_u16_le(self.error_count);
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::malformed(format!(
                "status payload is {} bytes, expected {}",
                data.len(),
                Self::SIZE
            )));
        }

        Ok(SlaveStatusReport {
            uptime: data.get_u32_le(),
            status: SlaveStatus::from(data.get_u8()),
            battery_percent: data.get_u8(),
            voltage_mv: data.get_u16_le(),
            free_heap_kb: data.get_u16_le(),
            free_fram_kb: data.get_u16_le(),
            total_fram_kb: data.get_u16_le(),
            free_flash_kb: data.get_u16_le(),
            total_flash_kb: data.get_u16_le(),
            pending_data_bytes: data.get_u16_le(),
            error_count: data.get_u16_le(),
        })
    }
}

/// Acknowledgment sent by the master
///
/// Wire format: `[acked_type:1]` optionally followed by `[batch_id:4 LE]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPayload {
    pub acked: MessageType,
    pub batch_id: Option<u32>,
}

impl AckPayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(self.acked.as_u8());
        if let Some(batch_id) = self.batch_id {
            buf.put_u32_le(batch_id);
        }
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::malformed("empty ACK payload"));
        }
        let acked = MessageType::from(data.get_u8());
        let batch_id = if data.remaining() >= 4 {
            Some(data.get_u32_le())
        } else {
            None
        };
        Ok(AckPayload { acked, batch_id })
    }
}

/// Position broadcast on the private channel
///
/// Wire format: `[lat_e7:i32][lon_e7:i32][alt_m:i32]`, little-endian.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionReport {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: i32,
}

impl PositionReport {
    pub const SIZE: usize = 12;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_i32_le((self.latitude * 1e7).round() as i32);
        buf.put_i32_le((self.longitude * 1e7).round() as i32);
        buf.put_i32_le(self.altitude);
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::malformed("position payload too short"));
        }
        Ok(PositionReport {
            latitude: data.get_i32_le() as f64 / 1e7,
            longitude: data.get_i32_le() as f64 / 1e7,
            altitude: data.get_i32_le(),
        })
    }
}
