//! Download destinations.
//!
//! Chunks finish in any order, so a sink only has to support positional
//! writes. On a fatal error the engine calls [`Sink::discard`] so nothing
//! half-assembled is left behind.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::TransferError;
use crate::transport::TransferFuture;

/// Positional byte destination.
pub trait Sink: Send + Sync {
    /// Writes `data` at absolute `offset`.
    fn write_at<'a>(&'a self, offset: u64, data: &'a [u8]) -> TransferFuture<'a, ()>;

    /// Called once after every chunk has been written.
    fn finish(&self) -> TransferFuture<'_, ()>;

    /// Drops whatever was written so far.
    fn discard(&self) -> TransferFuture<'_, ()>;
}

/// Writes into a local file.
pub struct FileSink {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<File>>,
}

impl FileSink {
    /// Opens `path` for writing, creating parent directories.
    ///
    /// With `overwrite` false an existing file is
    /// [`TransferError::AlreadyExists`]; otherwise it is truncated.
    pub async fn create(path: &Path, overwrite: bool) -> Result<Self, TransferError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut options = OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let file = options.open(path).await.map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => {
                TransferError::AlreadyExists(path.display().to_string())
            }
            _ => TransferError::Io(e),
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            file: tokio::sync::Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn closed() -> TransferError {
        TransferError::Io(io::Error::other("sink already finished or discarded"))
    }
}

impl Sink for FileSink {
    fn write_at<'a>(&'a self, offset: u64, data: &'a [u8]) -> TransferFuture<'a, ()> {
        Box::pin(async move {
            let mut guard = self.file.lock().await;
            let file = guard.as_mut().ok_or_else(Self::closed)?;
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
            Ok(())
        })
    }

    fn finish(&self) -> TransferFuture<'_, ()> {
        Box::pin(async move {
            let mut guard = self.file.lock().await;
            let mut file = guard.take().ok_or_else(Self::closed)?;
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        })
    }

    fn discard(&self) -> TransferFuture<'_, ()> {
        Box::pin(async move {
            // Close before removing.
            drop(self.file.lock().await.take());
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {
                    debug!(path = %self.path.display(), "removed partial download");
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink").field("path", &self.path).finish()
    }
}

/// Collects the download in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    data: Vec<u8>,
    finished: bool,
    discarded: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub fn is_discarded(&self) -> bool {
        self.lock().discarded
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Sink for MemorySink {
    fn write_at<'a>(&'a self, offset: u64, data: &'a [u8]) -> TransferFuture<'a, ()> {
        Box::pin(async move {
            let start = usize::try_from(offset)
                .map_err(|_| TransferError::InvalidArgument(format!("offset {offset}")))?;
            let end = start + data.len();
            let mut inner = self.lock();
            if inner.data.len() < end {
                inner.data.resize(end, 0);
            }
            inner.data[start..end].copy_from_slice(data);
            Ok(())
        })
    }

    fn finish(&self) -> TransferFuture<'_, ()> {
        Box::pin(async move {
            self.lock().finished = true;
            Ok(())
        })
    }

    fn discard(&self) -> TransferFuture<'_, ()> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.data.clear();
            inner.discarded = true;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_sink_writes_out_of_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let sink = FileSink::create(&path, false).await.unwrap();

        sink.write_at(5, b" World").await.unwrap();
        sink.write_at(0, b"Hello").await.unwrap();
        sink.finish().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"Hello World");
    }

    #[tokio::test]
    async fn file_sink_creates_subdirectories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/dir/file.txt");
        let sink = FileSink::create(&path, false).await.unwrap();
        sink.write_at(0, b"data").await.unwrap();
        sink.finish().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
    }

    #[tokio::test]
    async fn file_sink_refuses_existing_without_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taken.bin");
        std::fs::write(&path, b"keep me").unwrap();

        let err = FileSink::create(&path, false).await.unwrap_err();
        assert!(matches!(err, TransferError::AlreadyExists(_)));
        assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn file_sink_overwrite_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("old.bin");
        std::fs::write(&path, b"a much longer previous body").unwrap();

        let sink = FileSink::create(&path, true).await.unwrap();
        sink.write_at(0, b"new").await.unwrap();
        sink.finish().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[tokio::test]
    async fn file_sink_discard_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.bin");
        let sink = FileSink::create(&path, false).await.unwrap();
        sink.write_at(0, b"half").await.unwrap();

        sink.discard().await.unwrap();
        assert!(!path.exists());
        // A second discard is a no-op.
        sink.discard().await.unwrap();
        assert!(sink.write_at(0, b"late").await.is_err());
    }

    #[tokio::test]
    async fn memory_sink_positional() {
        let sink = MemorySink::new();
        sink.write_at(6, b"world!").await.unwrap();
        sink.write_at(0, b"Hello ").await.unwrap();
        sink.finish().await.unwrap();
        assert_eq!(sink.contents(), b"Hello world!");
        assert!(sink.is_finished());
    }

    #[tokio::test]
    async fn memory_sink_discard() {
        let sink = MemorySink::new();
        sink.write_at(0, b"abc").await.unwrap();
        sink.discard().await.unwrap();
        assert!(sink.is_discarded());
        assert!(sink.contents().is_empty());
    }
}
