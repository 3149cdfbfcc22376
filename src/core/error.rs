use std::io;
use thiserror::Error;

use crate::protocol::state::ControllerState;

/// Custom error types for the mesh master controller
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Short batch: need {needed} bytes, have {available}")]
    ShortBatch {
        /// Bytes required by the declared header
        needed: usize,
        /// Bytes actually present
        available: usize,
    },

    #[error("Invalid record size: {0}")]
    InvalidRecordSize(u8),

    #[error("Payload too large: {size} > {max}")]
    PayloadTooLarge {
        /// Encoded payload size
        size: usize,
        /// Allowed maximum
        max: usize,
    },

    #[error("Identity mismatch: {0}")]
    IdentityMismatch(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Handler fault: {0}")]
    HandlerFault(String),

    #[error("Not ready: controller is {0}")]
    NotReady(ControllerState),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// State the machine was in
        from: ControllerState,
        /// Rejected target state
        to: ControllerState,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Creates a new malformed frame error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedFrame(msg.into())
    }

    /// Creates a new identity mismatch error
    pub fn identity_mismatch(msg: impl Into<String>) -> Self {
        Error::IdentityMismatch(msg.into())
    }

    /// Creates a new capacity error
    pub fn capacity(msg: impl Into<String>) -> Self {
        Error::CapacityExceeded(msg.into())
    }

    /// Creates a new handler fault
    pub fn handler_fault(msg: impl Into<String>) -> Self {
        Error::HandlerFault(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Returns true for errors raised while decoding inbound bytes
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedFrame(_) | Error::ShortBatch { .. } | Error::InvalidRecordSize(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::transport("link down");
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(err.to_string(), "Transport error: link down");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_decode_error_classification() {
        assert!(Error::malformed("short").is_decode_error());
        assert!(Error::ShortBatch { needed: 8, available: 2 }.is_decode_error());
        assert!(Error::InvalidRecordSize(0).is_decode_error());
        assert!(!Error::NotReady(ControllerState::Connecting).is_decode_error());
    }

    #[test]
    fn test_not_ready_message() {
        let err = Error::NotReady(ControllerState::VerifyingKey);
        assert_eq!(err.to_string(), "Not ready: controller is verifying_key");
    }
}
