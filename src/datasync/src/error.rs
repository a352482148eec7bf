use std::path::PathBuf;
use thiserror::Error;
use wire::{NetworkError, ProtocolError, WireError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The transferred bytes did not match the sender's digest. Fatal to
    /// this transfer attempt only; the caller decides whether to rerun the
    /// sync or abort the task.
    #[error("content digest mismatch transferring {}", path.display())]
    Integrity { path: PathBuf },
    /// The peer reported a local filesystem failure on its side.
    #[error("peer reported a filesystem error")]
    Remote,
    #[error("file too large to transfer: {0} bytes")]
    TooLarge(u64),
    #[error("i/o error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<WireError> for SyncError {
    fn from(err: WireError) -> SyncError {
        match err {
            WireError::Network(e) => SyncError::Network(e),
            WireError::Protocol(e) => SyncError::Protocol(e),
        }
    }
}

impl SyncError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the channel is still usable after this error. Network and
    /// protocol failures poison the connection; the rest only poison the
    /// attempt.
    pub fn connection_dead(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Protocol(_))
    }
}
