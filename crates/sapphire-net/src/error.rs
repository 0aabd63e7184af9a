//! Error types for the device protocol stack

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, NetError>;

/// Device link and codec error types
#[derive(Debug, Error)]
pub enum NetError {
    /// Socket-level failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Retries exhausted without a valid acknowledgment
    #[error("timed out waiting for acknowledgment")]
    Timeout,

    /// Buffer too short for the field being decoded
    #[error("truncated buffer: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    /// Message type not present in the protocol registry
    #[error("unknown message type: {0}")]
    UnknownMessageType(u16),

    /// KV wire-type code outside the closed enum
    #[error("unknown wire type: {0}")]
    UnknownWireType(i8),

    /// Value cannot be represented in the requested wire type
    #[error("invalid field value: {0}")]
    InvalidValue(String),

    /// Datagram with a bad header on the server side
    #[error("invalid packet")]
    InvalidPacket,

    /// Reply arrived from an unexpected host
    #[error("reply from unexpected peer: {0}")]
    InvalidPeer(std::net::SocketAddr),

    /// Serial framing gave up after its retry budget
    #[error("serial frame error after retries")]
    Frame,

    /// Serial port error
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Client socket pool shut down
    #[error("socket pool closed")]
    PoolClosed,
}
