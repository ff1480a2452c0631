//! Error types for the bridge.

use std::io;
use std::time::Duration;

use bureau_engine::OracleError;
use thiserror::Error;

use crate::messages::MessageKind;
use crate::registry::SessionId;

/// Violations of the request/reply protocol. Each one aborts the
/// invocation in flight.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Bytes do not decode to any known message kind.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A well-formed message arrived where it is not a legal reply.
    #[error("unexpected {got} message, expected {expected}")]
    UnexpectedKind {
        expected: &'static str,
        got: MessageKind,
    },

    /// The peer did not answer within the configured bound.
    #[error("no reply from peer within {0:?}")]
    Timeout(Duration),
}

/// Errors surfaced by the bridge to its callers.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No port in the probe range could be bound.
    #[error("no bindable port in {start}..={max}")]
    ResourceExhausted { start: u16, max: u16 },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("memory oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("session {0} is closed")]
    SessionClosed(SessionId),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Whether the session's channel can no longer be trusted after this error.
    pub fn poisons_session(&self) -> bool {
        matches!(
            self,
            BridgeError::Protocol(_) | BridgeError::Transport(_) | BridgeError::Oracle(_)
        )
    }
}

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
