//! The single-request operations the engine drives.
//!
//! `Transport` is implemented on top of whatever client talks to the object
//! store. Using a trait keeps the chunking logic decoupled from HTTP and
//! testable with [`MemoryTransport`](crate::memory::MemoryTransport).

use std::future::Future;
use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;

use filelake_protocol::{
    AppendResponse, ContentRange, CreateResponse, ETag, FlushResponse, HttpRange,
    ObjectProperties,
};

use crate::TransferError;

/// Boxed future returned by transport and sink operations.
pub type TransferFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransferError>> + Send + 'a>>;

/// A lazily produced sequence of byte spans.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Creates (or truncates) the remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateRequest {
    /// When false the transport must fail with
    /// [`TransferError::AlreadyExists`] if the object exists.
    pub overwrite: bool,
}

/// Stages `data` at `offset`. Not visible to readers until flushed.
#[derive(Debug, Clone)]
pub struct AppendRequest<'a> {
    pub offset: u64,
    /// Borrowed from the chunk's pool buffer for the whole call.
    pub data: &'a [u8],
    /// Hex SHA-256 of `data`, when content validation is on.
    pub content_hash: Option<String>,
}

/// Commits staged data up to `position`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushRequest {
    pub position: u64,
    pub retain_uncommitted_data: bool,
    pub close: bool,
}

/// Reads one range, optionally conditioned on the object's ETag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeReadRequest {
    pub range: HttpRange,
    pub if_match: Option<ETag>,
}

/// Response to a range read. The body is consumed by the caller.
pub struct RangeReadResponse {
    pub body: ByteStream,
    pub properties: ObjectProperties,
    pub content_range: Option<ContentRange>,
}

impl std::fmt::Debug for RangeReadResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeReadResponse")
            .field("properties", &self.properties)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}

/// Abstract connection to the remote object.
///
/// Implementations map failures with [`TransferError::from_status`] (or
/// return `Io` errors for connection-level failures) so the engine's retry
/// policy can classify them.
pub trait Transport: Send + Sync {
    fn create(&self, request: CreateRequest) -> TransferFuture<'_, CreateResponse>;

    fn append<'a>(&'a self, request: AppendRequest<'a>) -> TransferFuture<'a, AppendResponse>;

    fn flush(&self, request: FlushRequest) -> TransferFuture<'_, FlushResponse>;

    fn read_range(&self, request: RangeReadRequest) -> TransferFuture<'_, RangeReadResponse>;
}
