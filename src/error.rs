//! Error types for riiwire.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::Fault;

/// Main error type for all stub and skel operations.
#[derive(Debug, Error)]
pub enum RiiError {
    /// I/O error during pipe/socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Fatal framing error; the byte stream cannot be resynchronised.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A well-delimited frame that could not be interpreted.
    ///
    /// `id` is the frame's call id when it carried a usable one.
    #[error("Malformed frame (id {id:?}): {reason}")]
    Malformed { id: Option<u64>, reason: String },

    /// The remote side answered the call with a fault.
    #[error("Remote fault: {0}")]
    Remote(Fault),

    /// The endpoint is closed or the connection went away.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No response arrived before the call deadline.
    #[error("Call to function {function} timed out after {after:?}")]
    Timeout { function: u32, after: Duration },
}

impl RiiError {
    /// Whether this error leaves the byte stream usable for further frames.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RiiError::Malformed { .. })
    }
}

/// Result type alias using RiiError.
pub type Result<T> = std::result::Result<T, RiiError>;
