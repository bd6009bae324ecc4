//! Uploader
//!
//! Bounded worker pool shipping sealed files to the remote store.
//!
//! ## Architecture
//!
//! ```text
//!  upload_async ──try_send──> [bounded queue] ──> spool-upload-0..N ──> ObjectStore
//!       │                        (full)
//!       └──────────── run inline on the caller's thread ──────────────> ObjectStore
//! ```
//!
//! A full queue makes the submitting thread do the upload itself, which
//! slows producers down to the pace of the store. Failed puts are retried
//! after a fixed delay on the same thread, forever unless `max_attempts`
//! is set.

use crate::spool::config::OutputConfig;
use crate::spool::object_store::{ObjectMetadata, ObjectStore, ObjectStoreError};
use crate::spool::staging_file::{SealedFile, StagingError};
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Runs once after a successful upload, with the file that was uploaded
pub type CompletionCallback = Box<dyn FnOnce(&SealedFile) -> Result<(), CallbackError> + Send>;

/// Callback removing the uploaded file's temp dir
pub fn delete_on_complete() -> CompletionCallback {
    Box::new(|file: &SealedFile| {
        file.delete()?;
        Ok(())
    })
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("uploader is closed")]
    Closed,
    #[error("completion callback failed for {key}: {source}")]
    Callback {
        key: String,
        #[source]
        source: CallbackError,
    },
    #[error("gave up uploading {key} after {attempts} attempts: {last_error}")]
    GaveUp {
        key: String,
        attempts: u32,
        #[source]
        last_error: ObjectStoreError,
    },
    #[error(transparent)]
    Staging(#[from] StagingError),
}

/// What happened to a file handed to `upload`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    /// The local file disappeared before it could be read
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploaderConfig {
    pub bucket: String,
    pub server_side_encryption: Option<String>,
    pub workers: usize,
    pub queue_size: usize,
    pub retry_delay: Duration,
    /// None retries forever
    pub max_attempts: Option<u32>,
}

impl UploaderConfig {
    pub fn from_output(config: &OutputConfig) -> Self {
        UploaderConfig {
            bucket: config.store.bucket.clone(),
            server_side_encryption: config.store.server_side_encryption.clone(),
            workers: config.upload_workers_count,
            queue_size: config.upload_queue_size,
            retry_delay: config.retry_delay,
            max_attempts: config.max_upload_attempts,
        }
    }
}

/// Snapshot of uploader counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploaderStats {
    pub uploaded: u64,
    pub bytes_uploaded: u64,
    pub retries: u64,
    /// Uploads run on the submitting thread because the queue was full
    pub inline: u64,
    pub abandoned: u64,
    pub gave_up: u64,
    pub callback_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    uploaded: AtomicU64,
    bytes_uploaded: AtomicU64,
    retries: AtomicU64,
    inline: AtomicU64,
    abandoned: AtomicU64,
    gave_up: AtomicU64,
    callback_failures: AtomicU64,
}

struct Task {
    file: SealedFile,
    on_complete: Option<CompletionCallback>,
}

struct Shared {
    store: Arc<dyn ObjectStore>,
    config: UploaderConfig,
    counters: Counters,
}

pub struct Uploader {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("config", &self.shared.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, config: UploaderConfig) -> std::io::Result<Self> {
        let workers = config.workers.max(1);
        let (sender, receiver) = bounded::<Task>(config.queue_size.max(1));
        let shared = Arc::new(Shared {
            store,
            config,
            counters: Counters::default(),
        });

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let receiver = receiver.clone();
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("spool-upload-{}", i))
                .spawn(move || worker_loop(shared, receiver))?;
            handles.push(handle);
        }

        info!(
            workers,
            queue_size = shared.config.queue_size,
            bucket = %shared.config.bucket,
            "Uploader started"
        );

        Ok(Uploader {
            shared,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            closed: AtomicBool::new(false),
        })
    }

    /// Queue `file` for upload, or upload it right here if the queue is
    /// full. Errors only come from inline uploads and a closed uploader.
    pub fn upload_async(
        &self,
        file: SealedFile,
        on_complete: Option<CompletionCallback>,
    ) -> Result<(), UploadError> {
        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            return Err(UploadError::Closed);
        };

        match sender.try_send(Task { file, on_complete }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) => {
                self.shared.counters.inline.fetch_add(1, Ordering::Relaxed);
                debug!(key = %task.file.key(), "Upload queue full, uploading inline");
                self.shared.run(task).map(|_| ())
            }
            Err(TrySendError::Disconnected(_)) => Err(UploadError::Closed),
        }
    }

    /// Upload `file` on the calling thread, retrying until it succeeds
    pub fn upload(
        &self,
        file: SealedFile,
        on_complete: Option<CompletionCallback>,
    ) -> Result<UploadOutcome, UploadError> {
        self.shared.run(Task { file, on_complete })
    }

    /// Stop accepting work, drain the queue and join the workers. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(queued = self.queue_len(), "Closing uploader, draining queue");
        drop(self.sender.lock().take());

        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("Upload worker panicked");
            }
        }
        info!(stats = ?self.stats(), "Uploader closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> usize {
        self.sender.lock().as_ref().map_or(0, |s| s.len())
    }

    pub fn stats(&self) -> UploaderStats {
        let c = &self.shared.counters;
        UploaderStats {
            uploaded: c.uploaded.load(Ordering::Relaxed),
            bytes_uploaded: c.bytes_uploaded.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            inline: c.inline.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            gave_up: c.gave_up.load(Ordering::Relaxed),
            callback_failures: c.callback_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(shared: Arc<Shared>, receiver: Receiver<Task>) {
    for task in receiver.iter() {
        let key = task.file.key().to_string();
        if let Err(e) = shared.run(task) {
            error!(key = %key, error = %e, "Upload task failed");
        }
    }
}

impl Shared {
    fn run(&self, task: Task) -> Result<UploadOutcome, UploadError> {
        let Task { file, on_complete } = task;
        let metadata = ObjectMetadata {
            content_length: file.size(),
            server_side_encryption: self.config.server_side_encryption.clone(),
        };

        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let result = match std::fs::File::open(file.path()) {
                Ok(mut reader) => {
                    self.store
                        .put_object(&self.config.bucket, file.key(), &mut reader, &metadata)
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    error!(
                        path = %file.path().display(),
                        key = %file.key(),
                        "Staging file vanished before upload, abandoning"
                    );
                    self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                    return Ok(UploadOutcome::Abandoned);
                }
                Err(e) => Err(ObjectStoreError::Io(e)),
            };

            let err = match result {
                Ok(()) => break,
                Err(e) => e,
            };

            if self.config.max_attempts.is_some_and(|max| attempt >= max) {
                error!(
                    key = %file.key(),
                    attempts = attempt,
                    error = %err,
                    "Giving up on upload, file left for recovery"
                );
                self.counters.gave_up.fetch_add(1, Ordering::Relaxed);
                return Err(UploadError::GaveUp {
                    key: file.key().to_string(),
                    attempts: attempt,
                    last_error: err,
                });
            }

            warn!(
                key = %file.key(),
                bucket = %self.config.bucket,
                attempt,
                error = %err,
                retry_in = ?self.config.retry_delay,
                "Upload failed, retrying"
            );
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            std::thread::sleep(self.config.retry_delay);
        }

        self.counters.uploaded.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_uploaded
            .fetch_add(file.size(), Ordering::Relaxed);
        debug!(key = %file.key(), size = file.size(), attempts = attempt, "Uploaded");

        if let Some(callback) = on_complete {
            if let Err(source) = callback(&file) {
                self.counters
                    .callback_failures
                    .fetch_add(1, Ordering::Relaxed);
                error!(key = %file.key(), error = %source, "Upload completion callback failed");
                return Err(UploadError::Callback {
                    key: file.key().to_string(),
                    source,
                });
            }
        }
        Ok(UploadOutcome::Uploaded)
    }
}
