//! Streaming file writer.
//!
//! Caller writes feed one end of a duplex pipe; a spawned uploader task
//! consumes the other end into the KV store. Back-pressure flows from the
//! store through the pipe to the caller. The uploader's terminal result is
//! handed over through a single-slot channel and observed by `commit` or
//! `close`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::byte_stream::ByteStream;
use crate::cluster::{Cluster, Role};
use crate::error::DriverError;
use crate::metadata;
use crate::metrics::DRIVER_METRICS;
use crate::storage::KvStorage;

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Closed,
    Committed,
    Cancelled,
}

/// A streaming writer for a single file path.
#[derive(Debug)]
pub struct FileWriter {
    cluster: Arc<Cluster>,
    path: String,
    key: String,
    append: bool,
    owner: Option<String>,

    size: AtomicU64,
    state: WriterState,
    pipe: Option<DuplexStream>,
    cancel: CancellationToken,
    result: Option<oneshot::Receiver<Result<u64, DriverError>>>,
}

impl FileWriter {
    /// Open a writer. For `append`, `size` and `key` come from the existing
    /// metadata row; fresh files start at zero with a generated key.
    ///
    /// Spawns the uploader immediately; the anticipated `content_size` is
    /// forwarded so the backend can announce the upload length up front.
    pub(crate) fn open(
        cluster: Arc<Cluster>,
        storage: Arc<dyn KvStorage>,
        path: String,
        key: String,
        append: bool,
        initial_size: u64,
        content_size: Option<u64>,
        owner: Option<String>,
    ) -> FileWriter {
        let (pipe_writer, pipe_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (result_tx, result_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let upload_cancel = cancel.clone();
        let upload_key = key.clone();
        tokio::spawn(async move {
            let data = ByteStream::new(ReaderStream::new(pipe_reader));
            let upload = async {
                if append {
                    storage.append(&upload_key, data, content_size).await
                } else {
                    storage.store(&upload_key, data, content_size).await
                }
            };

            // Cancellation must win over an upload that completed only
            // because the pipe was dropped on it.
            let result = tokio::select! {
                biased;
                _ = upload_cancel.cancelled() => Err(DriverError::UploadCancelled),
                result = upload => result,
            };
            let _ = result_tx.send(result);
        });

        debug!(path = %path, key = %key, append, "opened file writer");

        FileWriter {
            cluster,
            path,
            key,
            append,
            owner,
            size: AtomicU64::new(initial_size),
            state: WriterState::Open,
            pipe: Some(pipe_writer),
            cancel,
            result: Some(result_rx),
        }
    }

    /// Total bytes this writer accounts for: the starting size plus
    /// everything accepted by `write` so far.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn terminal_error(&self) -> Option<DriverError> {
        match self.state {
            WriterState::Open => None,
            WriterState::Closed => Some(DriverError::AlreadyClosed),
            WriterState::Committed => Some(DriverError::AlreadyCommitted),
            WriterState::Cancelled => Some(DriverError::AlreadyCancelled),
        }
    }

    /// Push bytes into the in-flight upload. Blocks while the uploader is
    /// behind; a dead uploader surfaces as a broken-pipe error.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, DriverError> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }

        let pipe = self
            .pipe
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("writer pipe is gone while open"))?;
        pipe.write_all(buf).await?;

        self.size.fetch_add(buf.len() as u64, Ordering::SeqCst);
        DRIVER_METRICS.bytes_written.mark(buf.len() as u64);

        Ok(buf.len())
    }

    /// Abort the upload. The uploader reports a cancellation error into the
    /// result slot, where a later `close` observes it.
    pub async fn cancel(&mut self) -> Result<(), DriverError> {
        if self.state == WriterState::Closed {
            return Err(DriverError::AlreadyClosed);
        }

        self.state = WriterState::Cancelled;
        self.cancel.cancel();
        self.pipe.take();

        Ok(())
    }

    /// Finish the upload and record it in metadata. On uploader failure the
    /// metadata is left untouched.
    pub async fn commit(&mut self) -> Result<(), DriverError> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }

        self.state = WriterState::Committed;
        self.shutdown_pipe().await;
        self.await_uploader().await?;

        let size = self.size.load(Ordering::SeqCst);
        if self.append {
            metadata::update_size(self.cluster.db(Role::Master), &self.path, size as i64).await?;
        } else {
            metadata::commit_file(
                self.cluster.db(Role::Master),
                &self.path,
                size as i64,
                &self.key,
                self.owner.as_deref(),
            )
            .await?;
        }

        debug!(path = %self.path, size, "committed file writer");
        Ok(())
    }

    /// Close the writer, waiting out the uploader and propagating its error.
    pub async fn close(&mut self) -> Result<(), DriverError> {
        if self.state == WriterState::Closed {
            return Err(DriverError::AlreadyClosed);
        }

        self.state = WriterState::Closed;
        self.shutdown_pipe().await;
        self.await_uploader().await?;

        Ok(())
    }

    async fn shutdown_pipe(&mut self) {
        if let Some(mut pipe) = self.pipe.take() {
            let _ = pipe.shutdown().await;
        }
    }

    /// Drain the uploader's terminal result, if it has not been drained yet.
    async fn await_uploader(&mut self) -> Result<(), DriverError> {
        let Some(result) = self.result.take() else {
            return Ok(());
        };

        match result.await {
            Ok(upload_result) => {
                upload_result?;
                Ok(())
            }
            Err(_) => Err(anyhow::anyhow!("uploader task terminated without reporting").into()),
        }
    }
}
