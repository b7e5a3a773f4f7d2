//! Upload sources.
//!
//! A source is a single-pass stream of byte spans. The scheduler copies
//! what it pulls into pool buffers, so a retried chunk never needs the
//! source again.

use std::collections::VecDeque;
use std::path::Path;

use bytes::Bytes;
use futures_util::{StreamExt, stream};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

use crate::TransferError;
use crate::transport::ByteStream;

/// Read size used when streaming files and readers.
const READ_CAPACITY: usize = 256 * 1024;

/// Bytes to upload plus their declared length, if known.
pub struct UploadSource {
    stream: ByteStream,
    length: Option<u64>,
}

impl UploadSource {
    /// One in-memory span.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let length = data.len() as u64;
        Self::from_stream(Box::pin(stream::iter([Ok(data)])), Some(length))
    }

    /// Several in-memory spans, uploaded back to back.
    pub fn from_spans(spans: Vec<Bytes>) -> Self {
        let length = spans.iter().map(|s| s.len() as u64).sum();
        Self::from_stream(Box::pin(stream::iter(spans.into_iter().map(Ok))), Some(length))
    }

    /// Any span stream. `length` is enforced when given.
    pub fn from_stream(stream: ByteStream, length: Option<u64>) -> Self {
        Self { stream, length }
    }

    /// An async reader, read in 256 KiB spans.
    pub fn from_reader<R>(reader: R, length: Option<u64>) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self::from_stream(
            Box::pin(ReaderStream::with_capacity(reader, READ_CAPACITY)),
            length,
        )
    }

    /// A local file; its current size becomes the declared length.
    pub async fn from_file(path: &Path) -> Result<Self, TransferError> {
        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();
        Ok(Self::from_reader(file, Some(length)))
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub(crate) fn into_reader(self) -> (SourceReader, Option<u64>) {
        (SourceReader::new(self.stream), self.length)
    }
}

impl std::fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSource")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Pulls exact byte counts out of a span stream, regardless of how the
/// spans line up with chunk boundaries.
pub(crate) struct SourceReader {
    stream: ByteStream,
    pending: VecDeque<Bytes>,
    consumed: u64,
}

impl SourceReader {
    fn new(stream: ByteStream) -> Self {
        Self {
            stream,
            pending: VecDeque::new(),
            consumed: 0,
        }
    }

    /// Bytes handed out so far.
    pub(crate) fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Appends up to `want` bytes to `out`. Returns fewer only at end of
    /// stream.
    pub(crate) async fn fill(
        &mut self,
        out: &mut Vec<u8>,
        want: usize,
    ) -> Result<usize, TransferError> {
        let mut filled = 0;
        while filled < want {
            let Some(mut span) = self.next_span().await? else {
                break;
            };
            let take = span.len().min(want - filled);
            out.extend_from_slice(&span[..take]);
            filled += take;
            if take < span.len() {
                self.pending.push_front(span.split_off(take));
            }
        }
        self.consumed += filled as u64;
        Ok(filled)
    }

    /// Puts bytes back in front of the stream.
    pub(crate) fn unread(&mut self, data: Bytes) {
        self.consumed -= data.len() as u64;
        if !data.is_empty() {
            self.pending.push_front(data);
        }
    }

    /// True once the stream has no bytes left.
    pub(crate) async fn is_exhausted(&mut self) -> Result<bool, TransferError> {
        match self.next_span().await? {
            Some(span) => {
                self.pending.push_front(span);
                Ok(false)
            }
            None => Ok(true),
        }
    }

    async fn next_span(&mut self) -> Result<Option<Bytes>, TransferError> {
        if let Some(span) = self.pending.pop_front() {
            return Ok(Some(span));
        }
        while let Some(span) = self.stream.next().await {
            let span = span?;
            if !span.is_empty() {
                return Ok(Some(span));
            }
        }
        Ok(None)
    }
}
