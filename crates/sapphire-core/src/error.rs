//! Error types for the object exchange

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, CoreError>;

/// Object exchange error types
#[derive(Debug, Error)]
pub enum CoreError {
    /// Mutation reserved to the originating process
    #[error("not originator of object {object_id}")]
    NotOriginator { object_id: String },

    /// Envelope or event that does not decode to the expected shape
    #[error("malformed message: {0}")]
    Malformed(String),

    /// JSON encode/decode error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Timestamp parse error
    #[error("timestamp error: {0}")]
    Timestamp(#[from] chrono::ParseError),

    /// Persistent store error
    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    /// Broker client error
    #[error("broker error: {0}")]
    Broker(#[from] redis::RedisError),
}
