//! Shared, durable, append-only log.
//!
//! Every operation on a [`LogStore`] runs inside one critical section guarded
//! by a single async mutex: write, flush, sync, seek and read are never
//! interleaved with another caller's. A snapshot therefore observes exactly
//! the appends that completed before it acquired the lock.
//!
//! An append that fails part-way is cut back off the file before the lock
//! is released, so no caller ever observes a fragment of a message.
//!
//! The backing file is also held under an exclusive advisory lock for the
//! lifetime of the store, so a second service instance pointed at the same
//! path fails at startup instead of corrupting the log.

use fs2::FileExt;
use std::future::Future;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, ErrorCode, Result};

/// Append-only log backed by a single file.
///
/// Dropping a store that was never discarded still deletes the file, so a
/// service that fails between binding and running leaves nothing behind.
#[derive(Debug)]
pub struct LogStore {
    /// Absolute path of the backing file
    path: PathBuf,
    /// Sync file data after each append
    sync_writes: bool,
    /// Open backing file; `None` once the store has been discarded
    file: Mutex<Option<File>>,
}

impl LogStore {
    /// Open (creating if necessary) the backing file and lock it.
    ///
    /// Does not require a running tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an `Io` error with code `LogStoreCreate` if the file cannot be
    /// created, or `LogStoreLocked` if another process holds its lock.
    pub fn create<P: AsRef<Path>>(path: P, sync_writes: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| {
                Error::io_with_code(
                    ErrorCode::LogStoreCreate,
                    format!("Failed to create log store at {}", path.display()),
                    e,
                )
            })?;

        FileExt::try_lock_exclusive(&file).map_err(|e| {
            Error::io_with_code(
                ErrorCode::LogStoreLocked,
                format!(
                    "Failed to lock log store at {}, another instance may be running",
                    path.display()
                ),
                e,
            )
        })?;

        // Later removal must not depend on the working directory.
        let path = std::fs::canonicalize(path).map_err(|e| {
            Error::io_with_code(
                ErrorCode::LogStoreCreate,
                format!("Failed to resolve log store path {}", path.display()),
                e,
            )
        })?;

        debug!(path = %path.display(), sync_writes, "Log store opened");
        Ok(Self {
            path,
            sync_writes,
            file: Mutex::new(Some(File::from_std(file))),
        })
    }

    /// Absolute path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `bytes` to the end of the log and flush them to storage.
    ///
    /// Returns the number of bytes written. A short write is logged and
    /// reported through the return value but is not an error.
    ///
    /// # Errors
    ///
    /// Returns an `Io` error if the write, flush or sync fails, or an
    /// `InvalidState` error if the store has been discarded.
    pub async fn append(&self, bytes: &[u8]) -> Result<usize> {
        let mut guard = self.file.lock().await;
        let file = Self::open_file(&mut guard)?;
        self.write_locked(file, bytes).await
    }

    /// Stream the entire current content of the log into `sink`.
    ///
    /// # Errors
    ///
    /// Returns an `Io` error if the log cannot be read or the sink rejects
    /// the data, or an `InvalidState` error if the store has been discarded.
    pub async fn snapshot_and_read<W>(&self, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut guard = self.file.lock().await;
        let file = Self::open_file(&mut guard)?;
        Self::snapshot_locked(file, sink).await
    }

    /// Append `bytes` and then stream the whole log into `sink` as one
    /// critical section, so the snapshot always contains this append.
    ///
    /// Returns the number of bytes streamed into `sink`.
    ///
    /// # Errors
    ///
    /// Any error [`append`](Self::append) or
    /// [`snapshot_and_read`](Self::snapshot_and_read) can return.
    pub async fn append_and_snapshot<W>(&self, bytes: &[u8], sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut guard = self.file.lock().await;
        let file = Self::open_file(&mut guard)?;
        self.write_locked(file, bytes).await?;
        Self::snapshot_locked(file, sink).await
    }

    /// Close the backing file, release its lock and delete it.
    ///
    /// Waits for any in-flight operation to finish first. Discarding twice
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an `Io` error if the file exists but cannot be removed.
    pub async fn discard(&self) -> Result<()> {
        let mut guard = self.file.lock().await;
        if guard.take().is_none() {
            return Ok(());
        }

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "Log store discarded");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io_with_source(
                format!("Failed to remove log store at {}", self.path.display()),
                e,
            )),
        }
    }

    fn open_file(slot: &mut Option<File>) -> Result<&mut File> {
        slot.as_mut()
            .ok_or_else(|| Error::invalid_state("Log store has been discarded"))
    }

    async fn write_locked<B: Backing>(&self, file: &mut B, bytes: &[u8]) -> Result<usize> {
        let start = file.len().await.map_err(|e| write_error(&self.path, e))?;

        match self.write_durably(file, bytes).await {
            Ok(written) => Ok(written),
            Err(e) => {
                if let Err(truncate_err) = file.truncate(start).await {
                    warn!(
                        error = %truncate_err,
                        len = start,
                        path = %self.path.display(),
                        "Failed to roll back partial append"
                    );
                }
                Err(write_error(&self.path, e))
            }
        }
    }

    async fn write_durably<B: Backing>(&self, file: &mut B, bytes: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < bytes.len() {
            match file.write(&bytes[written..]).await {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        if written < bytes.len() {
            warn!(
                requested = bytes.len(),
                written,
                path = %self.path.display(),
                "Short write to log store"
            );
        }

        file.flush().await?;
        if self.sync_writes {
            file.sync().await?;
        }

        Ok(written)
    }

    async fn snapshot_locked<W>(file: &mut File, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        file.seek(SeekFrom::Start(0)).await.map_err(read_error)?;
        let copied = tokio::io::copy(file, sink).await.map_err(read_error)?;
        sink.flush().await.map_err(read_error)?;
        Ok(copied)
    }
}

impl Drop for LogStore {
    fn drop(&mut self) {
        if self.file.get_mut().take().is_none() {
            return;
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Log store removed on drop"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, path = %self.path.display(), "Failed to remove log store"),
        }
    }
}

/// File operations an append needs beyond writing.
trait Backing: AsyncWrite + Unpin + Send {
    fn len(&mut self) -> impl Future<Output = io::Result<u64>> + Send;
    fn truncate(&mut self, len: u64) -> impl Future<Output = io::Result<()>> + Send;
    fn sync(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

impl Backing for File {
    async fn len(&mut self) -> io::Result<u64> {
        Ok(self.metadata().await?.len())
    }

    async fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len).await
    }

    async fn sync(&mut self) -> io::Result<()> {
        self.sync_data().await
    }
}

fn write_error(path: &Path, e: io::Error) -> Error {
    Error::io_with_code(
        ErrorCode::LogStoreWrite,
        format!("Failed to append to log store at {}", path.display()),
        e,
    )
}

fn read_error(e: io::Error) -> Error {
    Error::io_with_code(ErrorCode::LogStoreRead, "Failed to read log store", e)
}
