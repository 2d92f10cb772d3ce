//! Error Taxonomy
//!
//! Every failure that crosses a component boundary is one of five kinds.
//! Each kind carries a numeric code so it can be sent on the wire as
//! `{code, message}` and rebuilt on the other side.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message used for the transient reset sentinel.
pub const CONNECTION_RESET: &str = "Connection reset";

/// Errors shared by the transport, the request machine and reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Malformed or unexpected message shape.
    #[error("{0}")]
    Protocol(String),

    /// Wrong turn, a request already pending, game already ended, ...
    #[error("{0}")]
    StateConflict(String),

    /// Not a participant, or the identity has expired.
    #[error("{0}")]
    Unauthorized(String),

    /// Unknown request or game reference.
    #[error("{0}")]
    NotFound(String),

    /// The connection was reset before a response arrived.
    #[error("Connection reset")]
    ConnectionReset,
}

impl SyncError {
    /// Numeric code sent on the wire.
    pub fn code(&self) -> u16 {
        match self {
            SyncError::Protocol(_) => 400,
            SyncError::Unauthorized(_) => 403,
            SyncError::NotFound(_) => 404,
            SyncError::StateConflict(_) => 409,
            SyncError::ConnectionReset => 503,
        }
    }

    /// Whether the layer that sees this error may retry after reconnecting.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::ConnectionReset)
    }

    /// Shorthand constructors.
    pub fn conflict(msg: impl Into<String>) -> Self {
        SyncError::StateConflict(msg.into())
    }

    /// See [`SyncError::conflict`].
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        SyncError::Unauthorized(msg.into())
    }

    /// See [`SyncError::conflict`].
    pub fn not_found(msg: impl Into<String>) -> Self {
        SyncError::NotFound(msg.into())
    }

    /// See [`SyncError::conflict`].
    pub fn protocol(msg: impl Into<String>) -> Self {
        SyncError::Protocol(msg.into())
    }

    /// Wire form.
    pub fn to_wire(&self) -> WireError {
        WireError {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

/// Error as carried in `response` and `error` bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Numeric code (see [`SyncError::code`]).
    pub code: u16,
    /// Human-readable message.
    pub message: String,
}

impl From<WireError> for SyncError {
    fn from(err: WireError) -> Self {
        match err.code {
            403 => SyncError::Unauthorized(err.message),
            404 => SyncError::NotFound(err.message),
            409 => SyncError::StateConflict(err.message),
            503 => SyncError::ConnectionReset,
            _ => SyncError::Protocol(err.message),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(format!("Invalid message: {err}"))
    }
}
