//! Protocol implementation module
//!
//! This module defines the private mesh protocol messages, frame and batch
//! decoding, observer dispatch, the protocol engine and the controller
//! state machine.

pub mod batch;
pub mod codec;
pub mod engine;
pub mod events;
pub mod message;
pub mod state;

pub use self::batch::{Batch, DataBatch, TimestampedBatch, TimestampedRecord};
pub use self::codec::{decode_frame, encode_frame};
pub use self::engine::{EngineStats, ProtocolEngine};
pub use self::events::{
    BatchEvent, EventHub, Handler, HandlerList, PeerOfflineEvent, StatusEvent, TelemetryEvent,
};
pub use self::message::{
    AckPayload, CommandType, MasterCommand, MessageFlags, MessageType, PositionReport,
    ProtocolMessage, SlaveStatus, SlaveStatusReport,
};
pub use self::state::{ControllerState, StateChange, StateInfo, StateMachine};

/// Frame header size: type, flags and a 2-byte length
pub const HEADER_SIZE: usize = 4;

/// Largest payload the length field can describe
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;
