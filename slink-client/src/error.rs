use std::time::Duration;

/// Errors surfaced by configuration, negotiation, and transport calls.
///
/// The collection driver itself reports through [`Collect`] status codes
/// and logging rather than errors; see [`crate::collect`].
///
/// [`Collect`]: crate::Collect
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] slink_protocol::ProtocolError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("server closed the connection")]
    Disconnected,

    #[error("malformed server address: {0}")]
    BadAddress(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("unexpected server response: {0}")]
    UnexpectedResponse(String),

    #[error("{0}")]
    ModeConflict(&'static str),

    #[error("unparseable timestamp: {0:?}")]
    InvalidTimestamp(String),

    #[error("an INFO request is already pending")]
    InfoPending,

    #[error("state file line {line}: {reason}")]
    StateFile { line: usize, reason: String },

    #[error("stream list entry {entry:?}: {reason}")]
    StreamList { entry: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ClientError>;
