//! Protocol error types.

/// Errors produced while parsing or building wire values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid range header: {0}")]
    InvalidRange(String),

    #[error("invalid content-range header: {0}")]
    InvalidContentRange(String),

    #[error("empty etag")]
    EmptyETag,
}
