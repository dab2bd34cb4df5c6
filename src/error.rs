//! Error taxonomy for the QMP channel
//!
//! Every transport and framing failure is fatal to the session that produced it.
//! `QmpError::Command` is the one application-level error: the peer understood the
//! command and refused it, and the session stays usable.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, QmpError>;

#[derive(Error, Debug)]
pub enum QmpError {
    #[error("Invalid address '{0}': {1}")]
    InvalidAddress(String, String),

    /// Connect failed, or the peer reset the connection underneath a write
    #[error("Connection to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Capabilities negotiation failed: {0}")]
    Capabilities(String),

    #[error("Malformed message {line:?}: {reason}")]
    MalformedMessage { line: String, reason: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Capabilities have not been negotiated")]
    NotNegotiated,

    #[error("A command is already awaiting its response")]
    CommandPending,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out waiting for the peer")]
    Timeout,

    /// The peer rejected a command
    #[error("{class}: {desc}")]
    Command { class: String, desc: String },

    #[error("Socket I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl QmpError {
    /// Whether the session that produced this error must be discarded.
    ///
    /// A rejected command or an expired deadline leaves the byte stream in a
    /// consistent state; everything else does not.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, QmpError::Command { .. } | QmpError::Timeout)
    }

    pub(crate) fn malformed(line: &[u8], reason: impl ToString) -> Self {
        QmpError::MalformedMessage {
            line: String::from_utf8_lossy(line).trim_end().to_string(),
            reason: reason.to_string(),
        }
    }
}
