//! Transfer error types.

use std::io;

use filelake_protocol::{ProtocolError, StatusClass};

/// Errors produced by the transfer engine.
///
/// Only [`TransferError::is_retryable`] errors are ever retried; everything
/// else is fatal for the chunk that produced it and therefore for the whole
/// transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("service error {status}: {message}")]
    Service { status: u16, message: String },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("chunk {chunk} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        chunk: usize,
        attempts: u32,
        #[source]
        last: Box<TransferError>,
    },

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    /// Maps a non-success HTTP status to the matching error class.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match StatusClass::of(status) {
            StatusClass::PreconditionFailed => Self::PreconditionFailed(message),
            StatusClass::Transient => Self::TransientNetwork(format!("{status}: {message}")),
            StatusClass::Success | StatusClass::Service => Self::Service { status, message },
        }
    }

    /// Whether a chunk operation failing with this error may be re-issued.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientNetwork(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
