//! In-process object store.
//!
//! Behaves like a path-style service: `create` makes an empty object,
//! `append` stages bytes at an offset, `flush` commits staged bytes that
//! line up with the committed length and mints a new ETag. Reads honour
//! `If-Match`. Fault hooks let tests inject transient failures, fatal
//! statuses, broken bodies and concurrent writers.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream;

use filelake_protocol::{
    AppendResponse, ContentRange, CreateResponse, ETag, FlushResponse, HttpRange,
    ObjectProperties,
};

use crate::TransferError;
use crate::checksum::checksum_bytes;
use crate::transport::{
    AppendRequest, ByteStream, CreateRequest, FlushRequest, RangeReadRequest,
    RangeReadResponse, TransferFuture, Transport,
};

/// Size of the spans a read body is split into.
const BODY_SPAN: usize = 64 * 1024;

/// Call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub creates: u64,
    pub appends: u64,
    pub flushes: u64,
    pub reads: u64,
    /// Highest number of append/read calls observed running at once.
    pub peak_in_flight: usize,
}

struct Object {
    data: Bytes,
    etag: ETag,
    last_modified: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    committed: Option<Object>,
    staged: BTreeMap<u64, Vec<u8>>,
    version: u64,
    append_log: Vec<(u64, u64)>,
    hash_log: Vec<(u64, Option<String>)>,
    read_log: Vec<(HttpRange, Option<ETag>)>,
}

#[derive(Default)]
struct Faults {
    append_transient: HashMap<u64, u32>,
    append_status: HashMap<u64, u16>,
    read_transient: HashMap<u64, u32>,
    broken_bodies: HashMap<u64, u32>,
    mutate_after_reads: Option<u64>,
    ignore_if_match: bool,
}

#[derive(Default)]
struct Counters {
    creates: AtomicU64,
    appends: AtomicU64,
    flushes: AtomicU64,
    reads: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Tracks one running call for the peak-concurrency counter.
struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// [`Transport`] backed by process memory.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
    faults: Mutex<Faults>,
    counters: Counters,
    latency: Duration,
}

impl MemoryTransport {
    /// An empty store with no object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts with a committed object holding `data`.
    pub fn with_object(self, data: impl Into<Bytes>) -> Self {
        {
            let mut state = self.lock_state();
            let etag = next_etag(&mut state);
            state.committed = Some(Object {
                data: data.into(),
                etag,
                last_modified: Utc::now(),
            });
        }
        self
    }

    /// Delays every append and read by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// The next `times` appends at `offset` fail with a 503.
    pub fn fail_appends_at(&self, offset: u64, times: u32) {
        self.lock_faults().append_transient.insert(offset, times);
    }

    /// Every append at `offset` fails with `status`.
    pub fn fail_append_with_status(&self, offset: u64, status: u16) {
        self.lock_faults().append_status.insert(offset, status);
    }

    /// The next `times` reads starting at `offset` fail with a 500.
    pub fn fail_reads_at(&self, offset: u64, times: u32) {
        self.lock_faults().read_transient.insert(offset, times);
    }

    /// The next `times` reads starting at `offset` deliver half the body and
    /// then reset the connection.
    pub fn break_body_at(&self, offset: u64, times: u32) {
        self.lock_faults().broken_bodies.insert(offset, times);
    }

    /// Once `reads` reads have been served, a concurrent writer replaces
    /// the object (new ETag).
    pub fn mutate_after_reads(&self, reads: u64) {
        self.lock_faults().mutate_after_reads = Some(reads);
    }

    /// Serves reads without evaluating `If-Match`, like a server or proxy
    /// that drops the header.
    pub fn ignore_if_match(&self) {
        self.lock_faults().ignore_if_match = true;
    }

    /// Simulates a concurrent writer: same bytes, new version.
    pub fn touch(&self) {
        let mut state = self.lock_state();
        let etag = next_etag(&mut state);
        if let Some(object) = state.committed.as_mut() {
            object.etag = etag;
            object.last_modified = Utc::now();
        }
    }

    /// Committed bytes, if the object exists.
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.lock_state().committed.as_ref().map(|o| o.data.to_vec())
    }

    pub fn etag(&self) -> Option<ETag> {
        self.lock_state().committed.as_ref().map(|o| o.etag.clone())
    }

    pub fn stats(&self) -> TransportStats {
        let c = &self.counters;
        TransportStats {
            creates: c.creates.load(Ordering::SeqCst),
            appends: c.appends.load(Ordering::SeqCst),
            flushes: c.flushes.load(Ordering::SeqCst),
            reads: c.reads.load(Ordering::SeqCst),
            peak_in_flight: c.peak_in_flight.load(Ordering::SeqCst),
        }
    }

    /// Every append attempt as `(offset, length)`, in arrival order.
    pub fn append_log(&self) -> Vec<(u64, u64)> {
        self.lock_state().append_log.clone()
    }

    /// The content hash each append attempt carried, in arrival order.
    pub fn append_hashes(&self) -> Vec<(u64, Option<String>)> {
        self.lock_state().hash_log.clone()
    }

    /// Every read attempt with its `If-Match`, in arrival order.
    pub fn read_log(&self) -> Vec<(HttpRange, Option<ETag>)> {
        self.lock_state().read_log.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn append_now(&self, request: &AppendRequest<'_>) -> Result<AppendResponse, TransferError> {
        {
            let mut faults = self.lock_faults();
            if let Some(&status) = faults.append_status.get(&request.offset) {
                return Err(TransferError::from_status(status, "injected append failure"));
            }
            if take_one(&mut faults.append_transient, request.offset) {
                return Err(TransferError::from_status(503, "server busy"));
            }
        }

        if let Some(expected) = &request.content_hash {
            if checksum_bytes(request.data) != *expected {
                return Err(TransferError::InvalidArgument(format!(
                    "content hash mismatch at offset {}",
                    request.offset
                )));
            }
        }

        let mut state = self.lock_state();
        if state.committed.is_none() {
            return Err(TransferError::from_status(404, "path not found"));
        }
        state.staged.insert(request.offset, request.data.to_vec());
        Ok(AppendResponse {
            etag: None,
            server_encrypted: false,
        })
    }

    fn read_now(&self, request: &RangeReadRequest) -> Result<RangeReadResponse, TransferError> {
        let offset = request.range.offset;
        let check_if_match = {
            let mut faults = self.lock_faults();
            if take_one(&mut faults.read_transient, offset) {
                return Err(TransferError::from_status(500, "internal error"));
            }
            !faults.ignore_if_match
        };

        let (data, properties) = {
            let state = self.lock_state();
            let object = state
                .committed
                .as_ref()
                .ok_or_else(|| TransferError::from_status(404, "path not found"))?;
            if let Some(expected) = request.if_match.as_ref().filter(|_| check_if_match) {
                if *expected != object.etag {
                    return Err(TransferError::from_status(
                        412,
                        format!("If-Match {expected} does not match {}", object.etag),
                    ));
                }
            }
            let properties = ObjectProperties {
                etag: object.etag.clone(),
                last_modified: object.last_modified,
                content_length: object.data.len() as u64,
            };
            (object.data.clone(), properties)
        };

        let total = data.len() as u64;
        if offset > total || (offset == total && total > 0) {
            return Err(TransferError::from_status(
                416,
                format!("range {} not satisfiable for {total} bytes", request.range),
            ));
        }
        let end = match request.range.length {
            Some(len) => (offset + len).min(total),
            None => total,
        };
        let body = data.slice(offset as usize..end as usize);
        let content_range = (end > offset).then(|| ContentRange {
            start: offset,
            end_inclusive: end - 1,
            total: Some(total),
        });

        let broken = take_one(&mut self.lock_faults().broken_bodies, offset);
        let body = if broken {
            broken_stream(body)
        } else {
            span_stream(body)
        };

        self.after_read();
        Ok(RangeReadResponse {
            body,
            properties,
            content_range,
        })
    }

    fn after_read(&self) {
        let reads = self.counters.reads.load(Ordering::SeqCst);
        let mutate = {
            let mut faults = self.lock_faults();
            match faults.mutate_after_reads {
                Some(n) if reads >= n => {
                    faults.mutate_after_reads = None;
                    true
                }
                _ => false,
            }
        };
        if mutate {
            self.touch();
        }
    }
}

impl Transport for MemoryTransport {
    fn create(&self, request: CreateRequest) -> TransferFuture<'_, CreateResponse> {
        Box::pin(async move {
            self.counters.creates.fetch_add(1, Ordering::SeqCst);
            let mut state = self.lock_state();
            if state.committed.is_some() && !request.overwrite {
                return Err(TransferError::AlreadyExists("path already exists".into()));
            }
            let etag = next_etag(&mut state);
            let last_modified = Utc::now();
            state.staged.clear();
            state.committed = Some(Object {
                data: Bytes::new(),
                etag: etag.clone(),
                last_modified,
            });
            Ok(CreateResponse {
                etag,
                last_modified,
            })
        })
    }

    fn append<'a>(&'a self, request: AppendRequest<'a>) -> TransferFuture<'a, AppendResponse> {
        Box::pin(async move {
            let _in_flight = InFlight::enter(&self.counters);
            self.counters.appends.fetch_add(1, Ordering::SeqCst);
            {
                let mut state = self.lock_state();
                state
                    .append_log
                    .push((request.offset, request.data.len() as u64));
                state
                    .hash_log
                    .push((request.offset, request.content_hash.clone()));
            }
            self.simulate_latency().await;
            self.append_now(&request)
        })
    }

    fn flush(&self, request: FlushRequest) -> TransferFuture<'_, FlushResponse> {
        Box::pin(async move {
            self.counters.flushes.fetch_add(1, Ordering::SeqCst);
            let mut state = self.lock_state();
            let committed = state
                .committed
                .as_ref()
                .map(|o| o.data.clone())
                .ok_or_else(|| TransferError::from_status(404, "path not found"))?;

            let mut cursor = committed.len() as u64;
            if request.position < cursor {
                return Err(TransferError::from_status(
                    400,
                    format!("position {} is behind committed length {cursor}", request.position),
                ));
            }
            let mut data = committed.to_vec();
            while cursor < request.position {
                let chunk = state.staged.remove(&cursor).ok_or_else(|| {
                    TransferError::from_status(400, format!("no data staged at offset {cursor}"))
                })?;
                cursor += chunk.len() as u64;
                data.extend_from_slice(&chunk);
            }
            if cursor != request.position {
                return Err(TransferError::from_status(
                    400,
                    format!("staged data ends at {cursor}, not at {}", request.position),
                ));
            }
            if !request.retain_uncommitted_data {
                state.staged.clear();
            }

            let etag = next_etag(&mut state);
            let last_modified = Utc::now();
            let content_length = data.len() as u64;
            state.committed = Some(Object {
                data: Bytes::from(data),
                etag: etag.clone(),
                last_modified,
            });
            Ok(FlushResponse {
                etag,
                last_modified,
                content_length,
            })
        })
    }

    fn read_range(&self, request: RangeReadRequest) -> TransferFuture<'_, RangeReadResponse> {
        Box::pin(async move {
            let _in_flight = InFlight::enter(&self.counters);
            self.counters.reads.fetch_add(1, Ordering::SeqCst);
            self.lock_state()
                .read_log
                .push((request.range, request.if_match.clone()));
            self.simulate_latency().await;
            self.read_now(&request)
        })
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("etag", &self.etag())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn next_etag(state: &mut State) -> ETag {
    state.version += 1;
    ETag::strong(format_args!("0x{:016X}", state.version))
}

fn take_one(faults: &mut HashMap<u64, u32>, offset: u64) -> bool {
    match faults.get_mut(&offset) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

fn span_stream(body: Bytes) -> ByteStream {
    let spans: Vec<io::Result<Bytes>> = (0..body.len())
        .step_by(BODY_SPAN)
        .map(|start| Ok(body.slice(start..(start + BODY_SPAN).min(body.len()))))
        .collect();
    Box::pin(stream::iter(spans))
}

fn broken_stream(body: Bytes) -> ByteStream {
    let half = body.slice(..body.len() / 2);
    Box::pin(stream::iter(vec![
        Ok(half),
        Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )),
    ]))
}
