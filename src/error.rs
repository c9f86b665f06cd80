//! Error taxonomy shared by every session operation.

use std::time::Duration;

use thiserror::Error;

use crate::config::SessionMode;

/// Errors produced by session transport, correlation, and subscription handling.
#[derive(Debug, Error)]
pub enum XapiError {
    /// The transport never reached the open state.
    #[error("connection error: {0}")]
    Connection(String),

    /// The transport rejected a write or was not open.
    #[error("send error: {0}")]
    Send(String),

    /// No correlated reply arrived before the deadline.
    #[error("no reply to `{command}` within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// A streaming operation was attempted before a stream session id was bound.
    #[error("no stream session id is bound to this session")]
    NoStreamSession,

    /// The pending call was invalidated by the session closing.
    #[error("connection closed")]
    ConnectionClosed,

    /// Malformed or unrecognized inbound frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The service answered with `status: false`.
    #[error("remote error {code}: {description}")]
    Remote { code: String, description: String },

    /// The operation is not available in this session's mode.
    #[error("`{operation}` is not available on a {mode} session")]
    ModeMismatch {
        operation: &'static str,
        mode: SessionMode,
    },

    /// Session configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
