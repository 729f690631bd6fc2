use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Transport-level failure. `phase` names the protocol step that was in
    /// flight so callers can tell a failed connect from a mid-sync drop.
    #[error("transport error during {phase}: {detail}")]
    TransportError { phase: &'static str, detail: String },

    /// Malformed frame, varint, or CRDT structure after every decode fallback
    /// was exhausted.
    #[error("protocol decode error: {0}")]
    DecodeError(String),

    /// The handshake-plus-write sequence did not complete within the deadline.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The peer rejected the bearer token.
    #[error("authentication rejected: {0}")]
    AuthError(String),

    /// Caller-level misuse, e.g. writing an empty document.
    #[error("application error: {0}")]
    ApplicationError(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl SyncError {
    pub(crate) fn transport(phase: &'static str, detail: impl std::fmt::Display) -> Self {
        SyncError::TransportError {
            phase,
            detail: detail.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
