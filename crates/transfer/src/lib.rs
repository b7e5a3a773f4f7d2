//! Parallel chunked upload and download engine.
//!
//! Large objects are split into fixed-size chunks that move concurrently
//! through a [`Transport`]. Concurrency is bounded by a pool of reusable
//! buffers, transient failures are retried per chunk with the chunk's
//! original range, progress is reported as a non-decreasing byte count,
//! and downloads are pinned to the ETag of their first response.

mod buffer_pool;
mod checksum;
mod config;
mod dispatch;
mod download;
mod engine;
mod error;
mod memory;
mod planner;
mod progress;
mod retry;
mod sink;
mod source;
mod transport;
mod types;
mod upload;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use checksum::checksum_bytes;
pub use config::TransferOptions;
pub use download::ConsistencyGuard;
pub use engine::TransferEngine;
pub use error::TransferError;
pub use memory::{MemoryTransport, TransportStats};
pub use planner::{ChunkCursor, ChunkDescriptor, ChunkPlan, plan};
pub use progress::{ProgressCallback, ProgressState};
pub use retry::RetryPolicy;
pub use sink::{FileSink, MemorySink, Sink};
pub use source::UploadSource;
pub use transport::{
    AppendRequest, ByteStream, CreateRequest, FlushRequest, RangeReadRequest, RangeReadResponse,
    TransferFuture, Transport,
};
pub use types::{TransferRequest, TransferResult};

/// Default chunk size: 4 MiB.
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Largest accepted chunk size: 4000 MiB.
pub const MAX_BLOCK_SIZE: u64 = 4000 * 1024 * 1024;

/// Default number of chunks in flight per transfer.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Objects up to this size move in a single request by default: 100 MiB.
pub const DEFAULT_MAX_SINGLE_UPLOAD_SIZE: u64 = 100 * 1024 * 1024;

/// Default retries per chunk after the first attempt.
pub const DEFAULT_MAX_RETRY_REQUESTS: u32 = 5;
