//! Upload scheduler.
//!
//! Every upload is `create`, then appends, then exactly one `flush`. Small
//! sources go up as one append. Larger ones are cut into chunks, each
//! copied into a pool buffer and appended by its own task, so a retry
//! resends the buffered bytes instead of re-reading the source.

use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::TransferError;
use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::checksum::checksum_bytes;
use crate::dispatch::{Dispatcher, cancellable};
use crate::planner::{self, ChunkCursor, ChunkDescriptor, to_usize};
use crate::progress::ProgressState;
use crate::retry::RetryPolicy;
use crate::source::{SourceReader, UploadSource};
use crate::transport::{AppendRequest, CreateRequest, FlushRequest, Transport};
use crate::types::{TransferRequest, TransferResult};

/// Where chunk boundaries come from.
enum Layout {
    /// Known length: descriptors come from the planner.
    Planned(std::vec::IntoIter<ChunkDescriptor>),
    /// Unknown length: descriptors are cut as bytes arrive.
    Streaming(ChunkCursor),
}

pub(crate) async fn upload(
    transport: Arc<dyn Transport>,
    source: UploadSource,
    request: &TransferRequest,
) -> Result<TransferResult, TransferError> {
    let options = &request.options;
    let threshold = options.max_single_upload_size;
    let (mut reader, source_length) = source.into_reader();
    let length = request.total_size.or(source_length);

    cancellable(
        &request.cancel,
        transport.create(CreateRequest {
            overwrite: request.overwrite,
        }),
    )
    .await?;

    let progress = Arc::new(ProgressState::new(length, request.progress.clone()));

    let total = match length {
        Some(length) => {
            let plan = planner::plan(length, options.block_size, threshold)?;
            info!(
                transfer_id = %request.id,
                total_size = length,
                chunks = plan.chunks.len(),
                single_shot = plan.single_shot,
                "upload planned"
            );
            if plan.single_shot {
                let data = read_declared(&mut reader, length).await?;
                upload_single(transport.as_ref(), data, request, &progress).await?
            } else {
                let layout = Layout::Planned(plan.chunks.into_iter());
                upload_chunks(&transport, reader, layout, request, &progress).await?
            }
        }
        None => {
            // Buffer one byte past the threshold to learn which side of it
            // the source falls on.
            let mut probe = Vec::new();
            let want = to_usize(threshold.saturating_add(1))?;
            let got = reader.fill(&mut probe, want).await? as u64;
            if got <= threshold {
                info!(
                    transfer_id = %request.id,
                    total_size = got,
                    single_shot = true,
                    "upload planned"
                );
                progress.set_total(got);
                upload_single(transport.as_ref(), probe, request, &progress).await?
            } else {
                reader.unread(Bytes::from(probe));
                let cursor = ChunkCursor::new(options.block_size)?;
                info!(
                    transfer_id = %request.id,
                    block_size = cursor.block_size(),
                    "upload of unknown length, chunking as data arrives"
                );
                upload_chunks(&transport, reader, Layout::Streaming(cursor), request, &progress)
                    .await?
            }
        }
    };

    let flushed = cancellable(
        &request.cancel,
        transport.flush(FlushRequest {
            position: total,
            retain_uncommitted_data: false,
            close: true,
        }),
    )
    .await?;

    Ok(TransferResult {
        etag: flushed.etag,
        last_modified: flushed.last_modified,
        bytes_transferred: total,
    })
}

/// Reads exactly `length` bytes and checks nothing follows.
async fn read_declared(reader: &mut SourceReader, length: u64) -> Result<Vec<u8>, TransferError> {
    let want = to_usize(length)?;
    let mut data = Vec::with_capacity(want);
    let got = reader.fill(&mut data, want).await?;
    if got < want {
        return Err(TransferError::InvalidArgument(format!(
            "source produced {got} bytes, declared {length}"
        )));
    }
    if !reader.is_exhausted().await? {
        return Err(TransferError::InvalidArgument(format!(
            "source produced more than the declared {length} bytes"
        )));
    }
    Ok(data)
}

async fn upload_single(
    transport: &dyn Transport,
    data: Vec<u8>,
    request: &TransferRequest,
    progress: &ProgressState,
) -> Result<u64, TransferError> {
    if request.deadline.is_some_and(|d| Instant::now() >= d) {
        return Err(TransferError::DeadlineExceeded);
    }

    let length = data.len() as u64;
    // An empty object needs only the commit.
    if length > 0 {
        let hash = request
            .options
            .validate_content
            .then(|| checksum_bytes(&data));
        let data: &[u8] = &data;
        let cancel = &request.cancel;
        request
            .options
            .retry_policy()
            .run(ChunkDescriptor::new(0, 0, length), cancel, move |d| {
                append_once(transport, d.offset, data, hash.clone(), cancel)
            })
            .await?;
    }
    progress.add(length);
    Ok(length)
}

/// Runs the chunked path. Returns the number of bytes staged.
async fn upload_chunks(
    transport: &Arc<dyn Transport>,
    reader: SourceReader,
    layout: Layout,
    request: &TransferRequest,
    progress: &Arc<ProgressState>,
) -> Result<u64, TransferError> {
    let block_size = to_usize(request.options.block_size())?;
    let pool = BufferPool::new(request.options.max_concurrency(), block_size);
    let mut dispatcher = Dispatcher::new(pool, &request.cancel, request.deadline);

    let outcome = dispatch_appends(
        &mut dispatcher,
        transport,
        reader,
        layout,
        block_size,
        request,
        progress,
    )
    .await;
    if outcome.is_err() {
        dispatcher.shutdown().await;
    }
    outcome
}

async fn dispatch_appends(
    dispatcher: &mut Dispatcher,
    transport: &Arc<dyn Transport>,
    mut reader: SourceReader,
    mut layout: Layout,
    block_size: usize,
    request: &TransferRequest,
    progress: &Arc<ProgressState>,
) -> Result<u64, TransferError> {
    let policy = request.options.retry_policy();
    let validate = request.options.validate_content;

    loop {
        if let Layout::Planned(chunks) = &layout {
            if chunks.as_slice().is_empty() {
                break;
            }
        }

        let mut buffer = dispatcher.acquire().await?;
        let descriptor = match &mut layout {
            Layout::Planned(chunks) => {
                let Some(descriptor) = chunks.next() else {
                    break;
                };
                let want = to_usize(descriptor.length)?;
                if reader.fill(buffer.as_mut_vec(), want).await? < want {
                    return Err(TransferError::InvalidArgument(format!(
                        "source ended after {} bytes, before the declared length",
                        reader.consumed()
                    )));
                }
                descriptor
            }
            Layout::Streaming(cursor) => {
                let got = reader.fill(buffer.as_mut_vec(), block_size).await?;
                if got == 0 {
                    break;
                }
                cursor.advance(got as u64)
            }
        };

        debug!(
            transfer_id = %request.id,
            chunk = descriptor.index,
            offset = descriptor.offset,
            length = descriptor.length,
            "dispatching append"
        );
        let cancel = dispatcher.token();
        dispatcher.spawn(append_chunk(
            Arc::clone(transport),
            buffer,
            descriptor,
            policy.clone(),
            validate,
            cancel,
            Arc::clone(progress),
        ));
    }

    if matches!(layout, Layout::Planned(_)) && !reader.is_exhausted().await? {
        return Err(TransferError::InvalidArgument(format!(
            "source produced more than the declared {} bytes",
            reader.consumed()
        )));
    }

    dispatcher.join_all().await?;
    let total = reader.consumed();
    progress.set_total(total);
    Ok(total)
}

/// One chunk task. Owns its buffer until the append is acknowledged or
/// fails for good.
async fn append_chunk(
    transport: Arc<dyn Transport>,
    buffer: PooledBuffer,
    descriptor: ChunkDescriptor,
    policy: RetryPolicy,
    validate: bool,
    cancel: CancellationToken,
    progress: Arc<ProgressState>,
) -> Result<(), TransferError> {
    {
        let data: &[u8] = &buffer;
        let hash = validate.then(|| checksum_bytes(data));
        let transport: &dyn Transport = transport.as_ref();
        let cancel = &cancel;
        policy
            .run(descriptor, cancel, move |d| {
                append_once(transport, d.offset, data, hash.clone(), cancel)
            })
            .await?;
    }
    drop(buffer);

    progress.add(descriptor.length);
    debug!(
        chunk = descriptor.index,
        offset = descriptor.offset,
        "append acknowledged"
    );
    Ok(())
}

async fn append_once(
    transport: &dyn Transport,
    offset: u64,
    data: &[u8],
    content_hash: Option<String>,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    let request = AppendRequest {
        offset,
        data,
        content_hash,
    };
    cancellable(cancel, transport.append(request))
        .await
        .map(|_| ())
}
