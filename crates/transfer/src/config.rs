//! Transfer configuration.
//!
//! Options can be built in code, read from a JSON file with
//! [`TransferOptions::load`], or overlaid from `FILELAKE_*` environment
//! variables with [`TransferOptions::from_env`].

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::retry::RetryPolicy;
use crate::{
    DEFAULT_BLOCK_SIZE, DEFAULT_MAX_CONCURRENCY, DEFAULT_MAX_RETRY_REQUESTS,
    DEFAULT_MAX_SINGLE_UPLOAD_SIZE, MAX_BLOCK_SIZE, TransferError,
};

const ENV_BLOCK_SIZE: &str = "FILELAKE_BLOCK_SIZE";
const ENV_MAX_CONCURRENCY: &str = "FILELAKE_MAX_CONCURRENCY";
const ENV_MAX_SINGLE_UPLOAD_SIZE: &str = "FILELAKE_MAX_SINGLE_UPLOAD_SIZE";
const ENV_MAX_RETRY_REQUESTS: &str = "FILELAKE_MAX_RETRY_REQUESTS";

/// Tunables for one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransferOptions {
    /// Chunk size in bytes. `None` means [`DEFAULT_BLOCK_SIZE`].
    pub block_size: Option<u64>,
    /// Width of the worker pool and size of the buffer pool.
    /// `None` means [`DEFAULT_MAX_CONCURRENCY`].
    pub max_concurrency: Option<usize>,
    /// Objects at or below this size move in a single request. Applies to
    /// both directions.
    pub max_single_upload_size: u64,
    /// Retries per chunk after the first attempt.
    pub max_retry_requests: u32,
    /// Backoff before the first retry.
    pub retry_delay_ms: u64,
    /// Backoff cap.
    pub max_retry_delay_ms: u64,
    /// Attach a SHA-256 digest to every append.
    pub validate_content: bool,
    /// When false, downloads always take the single-request path.
    pub parallel_download: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            block_size: None,
            max_concurrency: None,
            max_single_upload_size: DEFAULT_MAX_SINGLE_UPLOAD_SIZE,
            max_retry_requests: DEFAULT_MAX_RETRY_REQUESTS,
            retry_delay_ms: 100,
            max_retry_delay_ms: 5_000,
            validate_content: false,
            parallel_download: true,
        }
    }
}

impl TransferOptions {
    /// Effective block size.
    pub fn block_size(&self) -> u64 {
        self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE)
    }

    /// Effective concurrency.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY)
    }

    /// Retry policy derived from these options.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retry_requests).with_backoff(
            Duration::from_millis(self.retry_delay_ms),
            Duration::from_millis(self.max_retry_delay_ms),
        )
    }

    /// Rejects option combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), TransferError> {
        match self.block_size {
            Some(0) => {
                return Err(TransferError::InvalidArgument(
                    "blockSize must be greater than 0".into(),
                ));
            }
            Some(size) if size > MAX_BLOCK_SIZE => {
                return Err(TransferError::InvalidArgument(format!(
                    "blockSize {size} exceeds the maximum of {MAX_BLOCK_SIZE}"
                )));
            }
            _ => {}
        }
        if self.max_concurrency == Some(0) {
            return Err(TransferError::InvalidArgument(
                "maxConcurrency must be at least 1".into(),
            ));
        }
        if self.max_retry_delay_ms < self.retry_delay_ms {
            return Err(TransferError::InvalidArgument(
                "maxRetryDelayMs must not be below retryDelayMs".into(),
            ));
        }
        Ok(())
    }

    /// Reads options from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, TransferError> {
        let raw = std::fs::read_to_string(path)?;
        let options: Self = serde_json::from_str(&raw).map_err(|e| {
            TransferError::InvalidArgument(format!("{}: {e}", path.display()))
        })?;
        options.validate()?;
        Ok(options)
    }

    /// Defaults overlaid with `FILELAKE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each variable.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Self::default();
        if let Some(v) = parse_var::<u64>(&lookup, ENV_BLOCK_SIZE) {
            options.block_size = Some(v);
        }
        if let Some(v) = parse_var::<usize>(&lookup, ENV_MAX_CONCURRENCY) {
            options.max_concurrency = Some(v);
        }
        if let Some(v) = parse_var::<u64>(&lookup, ENV_MAX_SINGLE_UPLOAD_SIZE) {
            options.max_single_upload_size = v;
        }
        if let Some(v) = parse_var::<u32>(&lookup, ENV_MAX_RETRY_REQUESTS) {
            options.max_retry_requests = v;
        }
        options
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable transfer option");
            None
        }
    }
}
