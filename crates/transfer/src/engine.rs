use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};

use crate::TransferError;
use crate::sink::{FileSink, Sink};
use crate::source::UploadSource;
use crate::transport::Transport;
use crate::types::{TransferRequest, TransferResult};
use crate::{download, upload};

/// Entry point for uploads and downloads over one [`Transport`].
///
/// Picks the single-shot or chunked path per request and returns either a
/// complete [`TransferResult`] or the first fatal error.
#[derive(Clone)]
pub struct TransferEngine {
    transport: Arc<dyn Transport>,
}

impl TransferEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Uploads `source`, replacing the remote object only if
    /// `request.overwrite` is set.
    pub async fn upload(
        &self,
        source: UploadSource,
        request: TransferRequest,
    ) -> Result<TransferResult, TransferError> {
        request.options.validate()?;
        let total_size = match (request.total_size, source.length()) {
            (Some(declared), Some(actual)) if declared != actual => {
                return Err(TransferError::InvalidArgument(format!(
                    "request declares {declared} bytes but the source has {actual}"
                )));
            }
            (declared, actual) => declared.or(actual),
        };

        info!(
            transfer_id = %request.id,
            direction = "upload",
            total_size = ?total_size,
            "transfer started"
        );
        let outcome = upload::upload(Arc::clone(&self.transport), source, &request).await;
        log_outcome(&request, "upload", &outcome);
        outcome
    }

    /// Uploads a local file.
    pub async fn upload_file(
        &self,
        path: &Path,
        request: TransferRequest,
    ) -> Result<TransferResult, TransferError> {
        let source = UploadSource::from_file(path).await?;
        self.upload(source, request).await
    }

    /// Downloads the remote object into `sink`. On failure the sink is
    /// discarded.
    pub async fn download(
        &self,
        sink: Arc<dyn Sink>,
        request: TransferRequest,
    ) -> Result<TransferResult, TransferError> {
        request.options.validate()?;
        info!(
            transfer_id = %request.id,
            direction = "download",
            total_size = ?request.total_size,
            "transfer started"
        );
        let outcome = download::download(Arc::clone(&self.transport), sink, &request).await;
        log_outcome(&request, "download", &outcome);
        outcome
    }

    /// Downloads into a local file. An existing file is
    /// [`TransferError::AlreadyExists`] unless `request.overwrite` is set; a
    /// failed download leaves no file behind.
    pub async fn download_to_file(
        &self,
        path: &Path,
        request: TransferRequest,
    ) -> Result<TransferResult, TransferError> {
        request.options.validate()?;
        let sink = FileSink::create(path, request.overwrite).await?;
        self.download(Arc::new(sink), request).await
    }
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine").finish_non_exhaustive()
    }
}

fn log_outcome(
    request: &TransferRequest,
    direction: &str,
    outcome: &Result<TransferResult, TransferError>,
) {
    match outcome {
        Ok(result) => info!(
            transfer_id = %request.id,
            direction,
            bytes = result.bytes_transferred,
            etag = %result.etag,
            "transfer completed"
        ),
        Err(e) => error!(
            transfer_id = %request.id,
            direction,
            error = %e,
            "transfer failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferOptions;
    use crate::memory::MemoryTransport;
    use crate::sink::MemorySink;

    fn engine(store: &Arc<MemoryTransport>) -> TransferEngine {
        TransferEngine::new(store.clone())
    }

    #[tokio::test]
    async fn declared_length_must_match_source() {
        let store = Arc::new(MemoryTransport::new());
        let err = engine(&store)
            .upload(
                UploadSource::from_bytes(&b"abc"[..]),
                TransferRequest::default().with_total_size(4),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidArgument(_)));
        assert_eq!(store.stats().creates, 0);
    }

    #[tokio::test]
    async fn invalid_options_rejected_up_front() {
        let store = Arc::new(MemoryTransport::new().with_object(&b"abc"[..]));
        let request = TransferRequest::new(TransferOptions {
            block_size: Some(0),
            ..Default::default()
        });
        let sink = Arc::new(MemorySink::new());
        let err = engine(&store).download(sink.clone(), request).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidArgument(_)));
        assert_eq!(store.stats().reads, 0);
        assert!(!sink.is_discarded());
    }

    #[tokio::test]
    async fn download_to_existing_file_needs_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("existing.bin");
        std::fs::write(&path, b"local").unwrap();
        let store = Arc::new(MemoryTransport::new().with_object(&b"remote"[..]));

        let err = engine(&store)
            .download_to_file(&path, TransferRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::AlreadyExists(_)));
        assert_eq!(std::fs::read(&path).unwrap(), b"local");

        engine(&store)
            .download_to_file(&path, TransferRequest::default().with_overwrite(true))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"remote");
    }
}
