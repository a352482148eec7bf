use std::time::Duration;
use thiserror::Error;

/// Transport-level failure. Always fatal to the connection it occurred on;
/// this layer never retries.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("i/o error with peer {peer}")]
    Io {
        peer: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {timeout:?} waiting on peer {peer}")]
    Timeout { peer: String, timeout: Duration },
    #[error("connection closed by peer {peer}")]
    Closed { peer: String },
}

/// The peer sent something that violates the expected message sequence.
/// Always fatal to the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("expected {expected}, got message code {got:#010x}")]
    UnexpectedMessage { expected: &'static str, got: u32 },
    #[error("unknown message code {0:#010x}")]
    UnknownCode(u32),
    #[error("protocol version mismatch: ours {ours:#010x}, theirs {theirs:#010x}")]
    VersionMismatch { ours: u32, theirs: u32 },
    #[error("incoming string of {0} bytes exceeds the sanity limit")]
    OversizedString(u32),
    #[error("malformed payload: {0}")]
    BadPayload(&'static str),
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
