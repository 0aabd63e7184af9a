//! Error types for device sessions

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Device session error types
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Channel failed or timed out; the monitor retries
    #[error("device unreachable: {0}")]
    Unreachable(String),

    /// Parameter name not present in the device's KV metadata
    #[error("unknown key: {0}")]
    UnknownKey(String),

    /// Attempt to write a parameter flagged read-only
    #[error("read-only key: {0}")]
    ReadOnlyKey(String),

    /// Two metadata records share a parameter name
    #[error("duplicate key name: {0}")]
    DuplicateKeyName(String),

    /// Two metadata records share a (group, id) pair
    #[error("duplicate key id: group {group} id {id}")]
    DuplicateKeyId { group: u8, id: u8 },

    /// Device rejected a typed access
    #[error("set rejected for {key}: status {status}")]
    SetRejected { key: String, status: i8 },

    /// Reply decoded to a different command than the one sent
    #[error("unexpected reply type: {0}")]
    UnexpectedReply(u16),

    /// Remote file error (missing, not created, removal failed, short write)
    #[error("file error: {0}")]
    File(String),

    /// No image on disk for the requested firmware id
    #[error("firmware image missing: {0}")]
    FirmwareMissing(String),

    /// Image failed its layout or checksum validation
    #[error("firmware image invalid: {0}")]
    FirmwareInvalid(String),

    /// Gateway time base unavailable and resync failed
    #[error("network time not synchronized")]
    TimeNotSynchronized,

    /// Protocol stack error
    #[error(transparent)]
    Net(#[from] sapphire_net::NetError),

    /// Exchange error
    #[error(transparent)]
    Core(#[from] sapphire_core::CoreError),

    /// Local filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
