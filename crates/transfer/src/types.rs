use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use filelake_protocol::ETag;

use crate::config::TransferOptions;
use crate::progress::ProgressCallback;

/// One upload or download call.
///
/// Owned by the call that runs it. The cancellation token can be cloned
/// out beforehand to stop the transfer from elsewhere.
#[derive(Clone)]
pub struct TransferRequest {
    /// Correlates log lines of one transfer.
    pub id: Uuid,
    pub options: TransferOptions,
    /// Object length when known up front.
    pub total_size: Option<u64>,
    /// Replace an existing destination instead of failing.
    pub overwrite: bool,
    pub progress: Option<ProgressCallback>,
    /// No new chunk is scheduled after this instant.
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
}

impl TransferRequest {
    pub fn new(options: TransferOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            options,
            total_size: None,
            overwrite: false,
            progress: None,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_total_size(mut self, total_size: u64) -> Self {
        self.total_size = Some(total_size);
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Registers a callback receiving cumulative byte counts.
    pub fn with_progress(mut self, callback: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Default for TransferRequest {
    fn default() -> Self {
        Self::new(TransferOptions::default())
    }
}

impl std::fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRequest")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("total_size", &self.total_size)
            .field("overwrite", &self.overwrite)
            .field("progress", &self.progress.is_some())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Outcome of a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    /// ETag of the committed (upload) or read (download) object.
    pub etag: ETag,
    pub last_modified: DateTime<Utc>,
    pub bytes_transferred: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let request = TransferRequest::default()
            .with_total_size(42)
            .with_overwrite(true)
            .with_progress(|_| {});
        assert_eq!(request.total_size, Some(42));
        assert!(request.overwrite);
        assert!(request.progress.is_some());
        assert!(request.deadline.is_none());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(TransferRequest::default().id, TransferRequest::default().id);
    }

    #[test]
    fn result_serializes_camel_case() {
        let result = TransferResult {
            etag: ETag::strong("0x1"),
            last_modified: DateTime::from_timestamp(0, 0).unwrap(),
            bytes_transferred: 12,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["bytesTransferred"], 12);
        assert_eq!(json["etag"], "\"0x1\"");
    }
}
