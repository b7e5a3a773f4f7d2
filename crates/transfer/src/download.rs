//! Download range executor.
//!
//! The first response pins the object's ETag. Every later request carries
//! it as `If-Match` and every later response is checked against it, so
//! the result never mixes bytes from two versions of the object. Chunks
//! are written to the sink at their own offsets and may finish in any
//! order.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use filelake_protocol::{ETag, HttpRange, ObjectProperties};

use crate::TransferError;
use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::dispatch::{Dispatcher, cancellable};
use crate::planner::{self, ChunkDescriptor, to_usize};
use crate::progress::ProgressState;
use crate::retry::RetryPolicy;
use crate::sink::Sink;
use crate::transport::{ByteStream, RangeReadRequest, RangeReadResponse, Transport};
use crate::types::{TransferRequest, TransferResult};

/// The ETag captured from the first response of a download.
///
/// Written once; a later response carrying any other ETag is a
/// precondition failure.
#[derive(Debug, Default)]
pub struct ConsistencyGuard {
    etag: OnceLock<ETag>,
}

impl ConsistencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures `etag` if nothing is captured yet, otherwise compares.
    pub fn observe(&self, etag: &ETag) -> Result<(), TransferError> {
        let captured = self.etag.get_or_init(|| etag.clone());
        if captured != etag {
            return Err(TransferError::PreconditionFailed(format!(
                "object changed during download: expected {captured}, got {etag}"
            )));
        }
        Ok(())
    }

    pub fn captured(&self) -> Option<&ETag> {
        self.etag.get()
    }
}

/// Everything a chunk task needs, cheap to clone per task.
#[derive(Clone)]
struct ChunkContext {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn Sink>,
    guard: Arc<ConsistencyGuard>,
    policy: RetryPolicy,
    progress: Arc<ProgressState>,
    cancel: CancellationToken,
}

/// Downloads into `sink`. On failure the sink is discarded.
pub(crate) async fn download(
    transport: Arc<dyn Transport>,
    sink: Arc<dyn Sink>,
    request: &TransferRequest,
) -> Result<TransferResult, TransferError> {
    let outcome = match fetch(&transport, &sink, request).await {
        Ok(result) => sink.finish().await.map(|()| result),
        Err(e) => Err(e),
    };

    if outcome.is_err() {
        if let Err(e) = sink.discard().await {
            warn!(transfer_id = %request.id, error = %e, "failed to discard partial download");
        }
    }
    outcome
}

async fn fetch(
    transport: &Arc<dyn Transport>,
    sink: &Arc<dyn Sink>,
    request: &TransferRequest,
) -> Result<TransferResult, TransferError> {
    let options = &request.options;
    let guard = Arc::new(ConsistencyGuard::new());
    let progress = Arc::new(ProgressState::new(
        request.total_size,
        request.progress.clone(),
    ));

    let single_shot = match request.total_size {
        _ if !options.parallel_download => true,
        Some(total) => {
            planner::plan(total, options.block_size, options.max_single_upload_size)?.single_shot
        }
        None => false,
    };
    if single_shot {
        info!(transfer_id = %request.id, single_shot = true, "download planned");
        return download_single(transport.as_ref(), sink.as_ref(), &guard, request, &progress)
            .await;
    }

    let block_size = options.block_size();
    let pool = BufferPool::new(options.max_concurrency(), to_usize(block_size)?);
    let mut dispatcher = Dispatcher::new(pool, &request.cancel, request.deadline);
    let ctx = ChunkContext {
        transport: Arc::clone(transport),
        sink: Arc::clone(sink),
        guard,
        policy: options.retry_policy(),
        progress,
        cancel: dispatcher.token(),
    };

    let outcome = download_chunks(&mut dispatcher, ctx, block_size, request).await;
    if outcome.is_err() {
        dispatcher.shutdown().await;
    }
    outcome
}

async fn download_chunks(
    dispatcher: &mut Dispatcher,
    ctx: ChunkContext,
    block_size: u64,
    request: &TransferRequest,
) -> Result<TransferResult, TransferError> {
    // The first chunk runs alone: it pins the ETag and reveals the size.
    let buffer = dispatcher.acquire().await?;
    let first = fetch_chunk(ctx.clone(), ChunkDescriptor::new(0, 0, block_size), buffer).await?;
    let total = first.content_length;
    ctx.progress.set_total(total);

    let plan = planner::plan(total, Some(block_size), 0)?;
    info!(
        transfer_id = %request.id,
        total_size = total,
        chunks = plan.chunks.len(),
        "download planned"
    );

    for descriptor in plan.chunks.into_iter().skip(1) {
        let buffer = dispatcher.acquire().await?;
        debug!(
            transfer_id = %request.id,
            chunk = descriptor.index,
            offset = descriptor.offset,
            length = descriptor.length,
            "dispatching range read"
        );
        let ctx = ctx.clone();
        dispatcher.spawn(async move { fetch_chunk(ctx, descriptor, buffer).await.map(drop) });
    }
    dispatcher.join_all().await?;

    Ok(TransferResult {
        etag: first.etag,
        last_modified: first.last_modified,
        bytes_transferred: total,
    })
}

/// Reads one chunk into its buffer, retrying the original range, then
/// writes it at the chunk's offset.
async fn fetch_chunk(
    ctx: ChunkContext,
    descriptor: ChunkDescriptor,
    mut buffer: PooledBuffer,
) -> Result<ObjectProperties, TransferError> {
    // Every attempt repeats the first attempt's condition.
    let if_match = ctx.guard.captured().cloned();
    let mut current = descriptor;
    let properties = loop {
        if ctx.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        buffer.clear();
        match read_chunk(&ctx, &current, if_match.clone(), buffer.as_mut_vec()).await {
            Ok(properties) => break properties,
            Err(e) => current = ctx.policy.recover(&current, e, &ctx.cancel).await?,
        }
    };

    let length = buffer.len() as u64;
    cancellable(&ctx.cancel, ctx.sink.write_at(descriptor.offset, &buffer)).await?;
    drop(buffer);

    ctx.progress.add(length);
    debug!(
        chunk = descriptor.index,
        offset = descriptor.offset,
        length,
        "chunk written"
    );
    Ok(properties)
}

async fn read_chunk(
    ctx: &ChunkContext,
    descriptor: &ChunkDescriptor,
    if_match: Option<ETag>,
    out: &mut Vec<u8>,
) -> Result<ObjectProperties, TransferError> {
    let request = RangeReadRequest {
        range: descriptor.range(),
        if_match,
    };
    let response = cancellable(&ctx.cancel, ctx.transport.read_range(request)).await?;
    ctx.guard.observe(&response.properties.etag)?;

    let RangeReadResponse {
        mut body,
        properties,
        content_range,
    } = response;

    if let Some(range) = content_range {
        if range.start != descriptor.offset {
            return Err(TransferError::InvalidArgument(format!(
                "asked for {}, got bytes starting at {}",
                descriptor.range(),
                range.start
            )));
        }
    }

    // The last chunk may be cut short by the end of the object.
    let object_len = content_range
        .and_then(|r| r.total)
        .unwrap_or(properties.content_length);
    let expected = to_usize(descriptor.length.min(object_len.saturating_sub(descriptor.offset)))?;

    while let Some(span) = next_span(&mut body, &ctx.cancel).await? {
        if out.len() + span.len() > expected {
            return Err(TransferError::InvalidArgument(format!(
                "{} returned more than {expected} bytes",
                descriptor.range()
            )));
        }
        out.extend_from_slice(&span);
    }
    if out.len() != expected {
        return Err(TransferError::InvalidArgument(format!(
            "{} returned {} of {expected} bytes",
            descriptor.range(),
            out.len()
        )));
    }
    Ok(properties)
}

/// One request for the whole object, streamed straight into the sink.
async fn download_single(
    transport: &dyn Transport,
    sink: &dyn Sink,
    guard: &ConsistencyGuard,
    request: &TransferRequest,
    progress: &ProgressState,
) -> Result<TransferResult, TransferError> {
    if request.deadline.is_some_and(|d| Instant::now() >= d) {
        return Err(TransferError::DeadlineExceeded);
    }

    let policy = request.options.retry_policy();
    let mut current = ChunkDescriptor::new(0, 0, request.total_size.unwrap_or(0));
    // Bytes already reported; a retry rewrites from offset 0 without
    // reporting them twice.
    let mut reported = 0;
    let if_match = guard.captured().cloned();
    loop {
        let attempt = stream_whole(
            transport,
            sink,
            guard,
            if_match.clone(),
            &request.cancel,
            progress,
            &mut reported,
        );
        match attempt.await {
            Ok(properties) => {
                return Ok(TransferResult {
                    etag: properties.etag,
                    last_modified: properties.last_modified,
                    bytes_transferred: properties.content_length,
                });
            }
            Err(e) => current = policy.recover(&current, e, &request.cancel).await?,
        }
    }
}

async fn stream_whole(
    transport: &dyn Transport,
    sink: &dyn Sink,
    guard: &ConsistencyGuard,
    if_match: Option<ETag>,
    cancel: &CancellationToken,
    progress: &ProgressState,
    reported: &mut u64,
) -> Result<ObjectProperties, TransferError> {
    let request = RangeReadRequest {
        range: HttpRange::full(),
        if_match,
    };
    let response = cancellable(cancel, transport.read_range(request)).await?;
    guard.observe(&response.properties.etag)?;

    let RangeReadResponse {
        mut body,
        properties,
        ..
    } = response;
    let expected = properties.content_length;
    progress.set_total(expected);

    let mut written = 0u64;
    while let Some(span) = next_span(&mut body, cancel).await? {
        let end = written + span.len() as u64;
        if end > expected {
            return Err(TransferError::InvalidArgument(format!(
                "body exceeds the object length of {expected} bytes"
            )));
        }
        cancellable(cancel, sink.write_at(written, &span)).await?;
        written = end;
        if written > *reported {
            progress.add(written - *reported);
            *reported = written;
        }
    }
    if written != expected {
        return Err(TransferError::InvalidArgument(format!(
            "body ended after {written} of {expected} bytes"
        )));
    }
    if expected == 0 {
        progress.add(0);
    }
    Ok(properties)
}

async fn next_span(
    body: &mut ByteStream,
    cancel: &CancellationToken,
) -> Result<Option<Bytes>, TransferError> {
    let span = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        span = body.next() => span,
    };
    Ok(span.transpose()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::config::TransferOptions;
    use crate::memory::MemoryTransport;
    use crate::sink::{FileSink, MemorySink};

    fn options(block_size: u64, max_single: u64, concurrency: usize) -> TransferOptions {
        TransferOptions {
            block_size: Some(block_size),
            max_concurrency: Some(concurrency),
            max_single_upload_size: max_single,
            retry_delay_ms: 0,
            max_retry_delay_ms: 0,
            ..Default::default()
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 241) as u8).collect()
    }

    async fn run(
        store: &Arc<MemoryTransport>,
        sink: &Arc<MemorySink>,
        request: TransferRequest,
    ) -> Result<TransferResult, TransferError> {
        let transport: Arc<dyn Transport> = store.clone();
        let sink: Arc<dyn Sink> = sink.clone();
        download(transport, sink, &request).await
    }

    #[test]
    fn guard_captures_once() {
        let guard = ConsistencyGuard::new();
        let a = ETag::strong("a");
        let b = ETag::strong("b");
        assert!(guard.captured().is_none());
        guard.observe(&a).unwrap();
        guard.observe(&a).unwrap();
        assert!(matches!(
            guard.observe(&b),
            Err(TransferError::PreconditionFailed(_))
        ));
        assert_eq!(guard.captured(), Some(&a));
    }

    #[tokio::test]
    async fn chunked_download_assembles_object() {
        let data = pattern(1000);
        let store = Arc::new(MemoryTransport::new().with_object(data.clone()));
        let sink = Arc::new(MemorySink::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let request = TransferRequest::new(options(128, 0, 3))
            .with_progress(move |v| recorder.lock().unwrap().push(v));

        let result = run(&store, &sink, request).await.unwrap();

        assert_eq!(result.bytes_transferred, 1000);
        assert_eq!(Some(result.etag), store.etag());
        assert_eq!(sink.contents(), data);
        assert!(sink.is_finished());
        assert_eq!(store.stats().reads, 8);

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 1000);
    }

    #[tokio::test]
    async fn later_chunks_carry_if_match() {
        let store = Arc::new(MemoryTransport::new().with_object(pattern(300)));
        let sink = Arc::new(MemorySink::new());
        run(&store, &sink, TransferRequest::new(options(100, 0, 2)))
            .await
            .unwrap();

        let log = store.read_log();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0], (HttpRange::new(0, 100), None));
        let etag = store.etag();
        assert!(log[1..].iter().all(|(_, if_match)| *if_match == etag));
    }

    #[tokio::test]
    async fn etag_change_fails_and_discards() {
        let store = Arc::new(MemoryTransport::new().with_object(pattern(500)));
        store.mutate_after_reads(1);
        let sink = Arc::new(MemorySink::new());

        let err = run(&store, &sink, TransferRequest::new(options(100, 0, 2)))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::PreconditionFailed(_)));
        assert!(sink.is_discarded());
        assert!(sink.contents().is_empty());
    }

    #[tokio::test]
    async fn etag_change_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("object.bin");
        let store = Arc::new(MemoryTransport::new().with_object(pattern(500)));
        store.mutate_after_reads(1);
        let transport: Arc<dyn Transport> = store.clone();
        let sink: Arc<dyn Sink> = Arc::new(FileSink::create(&path, false).await.unwrap());

        let err = download(transport, sink, &TransferRequest::new(options(100, 0, 2)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::PreconditionFailed(_)));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn transient_read_retries_original_range() {
        let store = Arc::new(MemoryTransport::new().with_object(pattern(400)));
        store.fail_reads_at(200, 2);
        let sink = Arc::new(MemorySink::new());
        run(&store, &sink, TransferRequest::new(options(100, 0, 2)))
            .await
            .unwrap();

        let at_200: Vec<_> = store
            .read_log()
            .into_iter()
            .filter(|(range, _)| range.offset == 200)
            .collect();
        assert_eq!(at_200.len(), 3);
        let etag = store.etag();
        assert!(
            at_200
                .iter()
                .all(|(range, if_match)| *range == HttpRange::new(200, 100) && *if_match == etag)
        );
        assert_eq!(sink.contents(), pattern(400));
    }

    #[tokio::test]
    async fn broken_body_retries_full_chunk() {
        let store = Arc::new(MemoryTransport::new().with_object(pattern(400)));
        store.break_body_at(100, 1);
        let sink = Arc::new(MemorySink::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let request = TransferRequest::new(options(100, 0, 2))
            .with_progress(move |v| recorder.lock().unwrap().push(v));

        run(&store, &sink, request).await.unwrap();

        let at_100: Vec<_> = store
            .read_log()
            .into_iter()
            .filter(|(range, _)| range.offset == 100)
            .map(|(range, _)| range)
            .collect();
        assert_eq!(at_100, vec![HttpRange::new(100, 100); 2]);
        assert_eq!(sink.contents(), pattern(400));
        assert_eq!(*seen.lock().unwrap().last().unwrap(), 400);
    }

    #[tokio::test]
    async fn first_chunk_retry_repeats_its_condition() {
        let store = Arc::new(MemoryTransport::new().with_object(pattern(300)));
        store.break_body_at(0, 1);
        let sink = Arc::new(MemorySink::new());
        run(&store, &sink, TransferRequest::new(options(100, 0, 2)))
            .await
            .unwrap();

        let at_0: Vec<_> = store
            .read_log()
            .into_iter()
            .filter(|(range, _)| range.offset == 0)
            .collect();
        assert_eq!(at_0, vec![(HttpRange::new(0, 100), None); 2]);
        assert_eq!(sink.contents(), pattern(300));
    }

    #[tokio::test]
    async fn single_request_retry_repeats_its_condition() {
        let store = Arc::new(MemoryTransport::new().with_object(pattern(1000)));
        store.break_body_at(0, 1);
        let sink = Arc::new(MemorySink::new());
        let mut opts = options(100, 0, 2);
        opts.parallel_download = false;
        run(&store, &sink, TransferRequest::new(opts)).await.unwrap();

        assert_eq!(store.read_log(), vec![(HttpRange::full(), None); 2]);
        assert_eq!(sink.contents(), pattern(1000));
    }

    #[tokio::test]
    async fn changed_etag_in_response_fails_chunked() {
        let store = Arc::new(MemoryTransport::new().with_object(pattern(500)));
        store.ignore_if_match();
        store.mutate_after_reads(1);
        let sink = Arc::new(MemorySink::new());

        let err = run(&store, &sink, TransferRequest::new(options(100, 0, 2)))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::PreconditionFailed(_)));
        assert!(sink.is_discarded());
        assert!(sink.contents().is_empty());
    }

    #[tokio::test]
    async fn changed_etag_in_response_fails_single_request() {
        let store = Arc::new(MemoryTransport::new().with_object(pattern(500)));
        store.ignore_if_match();
        store.break_body_at(0, 1);
        store.mutate_after_reads(1);
        let sink = Arc::new(MemorySink::new());
        let mut opts = options(100, 0, 2);
        opts.parallel_download = false;

        let err = run(&store, &sink, TransferRequest::new(opts))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::PreconditionFailed(_)));
        assert_eq!(store.stats().reads, 2);
        assert!(sink.is_discarded());
    }

    #[tokio::test]
    async fn exhausted_retries_discard() {
        let store = Arc::new(MemoryTransport::new().with_object(pattern(400)));
        store.fail_reads_at(300, 10);
        let sink = Arc::new(MemorySink::new());
        let mut opts = options(100, 0, 2);
        opts.max_retry_requests = 1;

        let err = run(&store, &sink, TransferRequest::new(opts))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::RetriesExhausted { chunk: 3, attempts: 2, .. }
        ));
        assert!(sink.is_discarded());
    }

    #[tokio::test]
    async fn small_known_size_is_single_request() {
        let store = Arc::new(MemoryTransport::new().with_object(pattern(40)));
        let sink = Arc::new(MemorySink::new());
        let request = TransferRequest::new(options(8, 50, 4)).with_total_size(40);
        let result = run(&store, &sink, request).await.unwrap();

        assert_eq!(result.bytes_transferred, 40);
        assert_eq!(store.read_log(), vec![(HttpRange::full(), None)]);
        assert_eq!(sink.contents(), pattern(40));
    }

    #[tokio::test]
    async fn parallel_disabled_streams_whole_object() {
        let data = pattern(200_000);
        let store = Arc::new(MemoryTransport::new().with_object(data.clone()));
        store.break_body_at(0, 1);
        let sink = Arc::new(MemorySink::new());
        let mut opts = options(1024, 0, 4);
        opts.parallel_download = false;

        let result = run(&store, &sink, TransferRequest::new(opts)).await.unwrap();
        assert_eq!(result.bytes_transferred, 200_000);
        assert_eq!(store.stats().reads, 2);
        assert_eq!(sink.contents(), data);
    }

    #[tokio::test]
    async fn empty_object() {
        let store = Arc::new(MemoryTransport::new().with_object(Vec::new()));
        let sink = Arc::new(MemorySink::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let request = TransferRequest::new(options(64, 0, 2))
            .with_progress(move |v| recorder.lock().unwrap().push(v));

        let result = run(&store, &sink, request).await.unwrap();
        assert_eq!(result.bytes_transferred, 0);
        assert!(sink.contents().is_empty());
        assert!(sink.is_finished());
        assert_eq!(*seen.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let store = Arc::new(
            MemoryTransport::new()
                .with_object(pattern(2000))
                .with_latency(Duration::from_millis(5)),
        );
        let sink = Arc::new(MemorySink::new());
        run(&store, &sink, TransferRequest::new(options(100, 0, 4)))
            .await
            .unwrap();
        let stats = store.stats();
        assert_eq!(stats.reads, 20);
        assert!(stats.peak_in_flight <= 4, "peak {}", stats.peak_in_flight);
    }

    #[tokio::test]
    async fn missing_object_is_service_error() {
        let store = Arc::new(MemoryTransport::new());
        let sink = Arc::new(MemorySink::new());
        let err = run(&store, &sink, TransferRequest::new(options(100, 0, 2)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Service { status: 404, .. }));
        assert!(sink.is_discarded());
    }
}
