use thiserror::Error;

use crate::session::hook::HookError;

/// The session store's error type.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Enabling expired-key notifications or subscribing to them failed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A Redis command failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored record could not be deserialized.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A record could not be serialized.
    #[error("Encode error: {0}")]
    Encode(String),

    /// The eviction hook failed to revoke the session's credential.
    #[error("Eviction failed for session {sid}: {source}")]
    Eviction {
        sid: String,
        #[source]
        source: HookError,
    },

    /// An internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A `Result` type that uses `SessionError` as the error type.
pub type Result<T> = std::result::Result<T, SessionError>;

