//! Spool Output
//!
//! Ties the spool together: routes each record to its key's staging file,
//! rotates files by policy and hands finished files to the uploader.
//!
//! ## Architecture
//!
//! ```text
//!   deliver(batch) ──> KeyTemplate ──> FileRegistry ──> FileGenerator ──> StagingFile
//!                                                          │
//!   spool-rotate timer ──> rotate_all ─────────────────────┤ RotationPolicy
//!                                                          ▼
//!                                                   seal + Uploader ──> ObjectStore
//!                                                          │
//!                                                   delete temp dir
//! ```
//!
//! Lifecycle: `start` validates the config, probes the staging directory,
//! recovers leftovers and starts the timers. `stop` uploads every current
//! file and blocks until the upload queue drained.

use crate::spool::clock::{Clock, SystemClock};
use crate::spool::config::{ConfigError, OutputConfig, StoreConfig, StoreKind};
use crate::spool::event::{Event, KeyTemplate};
use crate::spool::file_generator::{FileFactory, GeneratorGuard};
use crate::spool::file_registry::FileRegistry;
use crate::spool::object_store::{
    InMemoryObjectStore, LocalFsObjectStore, ObjectStore, ObjectStoreError,
};
use crate::spool::periodic::PeriodicTask;
use crate::spool::recovery::{recover_staging_dir, RecoveryStats};
use crate::spool::rotation::RotationPolicy;
use crate::spool::staging_file::{normalize_routing_key, SealedFile, StagingError};
use crate::spool::uploader::{delete_on_complete, UploadError, Uploader, UploaderConfig, UploaderStats};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum OutputError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Store(#[from] ObjectStoreError),
    #[error("failed to start background thread: {0}")]
    Thread(#[from] std::io::Error),
    #[error("spool output is closed")]
    Closed,
}

impl OutputError {
    pub fn is_disk_full(&self) -> bool {
        matches!(self, OutputError::Staging(e) if e.is_disk_full())
    }
}

/// Build the store described by `config`
pub fn build_store(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>, OutputError> {
    match config.kind {
        StoreKind::InMemory => Ok(Arc::new(InMemoryObjectStore::new())),
        StoreKind::LocalFs => {
            let base = config
                .local_path
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("object-spool-store"));
            Ok(Arc::new(LocalFsObjectStore::new(base)))
        }
        #[cfg(feature = "s3")]
        StoreKind::S3 => Ok(Arc::new(crate::spool::s3_store::S3ObjectStore::new(
            config.clone(),
        )?)),
        #[cfg(not(feature = "s3"))]
        StoreKind::S3 => Err(ConfigError::Invalid(
            "store kind s3 requires building with the `s3` feature".to_string(),
        )
        .into()),
    }
}

struct OutputCore {
    config: OutputConfig,
    template: KeyTemplate,
    policy: RotationPolicy,
    registry: Arc<FileRegistry>,
    uploader: Uploader,
    store: Arc<dyn ObjectStore>,
}

/// The spool. Safe to share between writer threads.
pub struct SpoolOutput {
    core: Arc<OutputCore>,
    /// true while running. `deliver` holds it shared for a whole batch.
    running: RwLock<bool>,
    rotation_timer: Mutex<Option<PeriodicTask>>,
    recovery: Option<RecoveryStats>,
}

impl std::fmt::Debug for SpoolOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpoolOutput")
            .field("staging_dir", &self.core.config.staging_dir)
            .field("policy", &self.core.policy)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SpoolOutput {
    /// Start with the store described by `config.store` and the system clock
    pub fn start(config: OutputConfig) -> Result<Self, OutputError> {
        config.validate()?;
        let store = build_store(&config.store)?;
        Self::start_with(config, store, SystemClock::shared())
    }

    pub fn start_with(
        config: OutputConfig,
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, OutputError> {
        config.validate()?;
        let policy =
            RotationPolicy::from_config(config.rotation_strategy, config.size_rotate, config.time_rotate)?;
        prepare_staging_dir(&config.staging_dir)?;

        let uploader = Uploader::new(store.clone(), UploaderConfig::from_output(&config))?;

        // Before any new file exists, so only leftovers are picked up
        let recovery = if config.recover {
            Some(recover_staging_dir(&config.staging_dir, &uploader)?)
        } else {
            None
        };

        let factory = FileFactory::new(config.staging_dir.clone(), config.encoding, clock);
        let registry = Arc::new(FileRegistry::new(factory, config.stale_file_age));
        registry.start_sweeper(config.stale_sweep_interval)?;

        let core = Arc::new(OutputCore {
            template: KeyTemplate::parse(&config.prefix),
            policy,
            registry,
            uploader,
            store,
            config,
        });

        let rotation_timer = if policy.needs_periodic_check() {
            let weak: Weak<OutputCore> = Arc::downgrade(&core);
            Some(PeriodicTask::spawn(
                "spool-rotate",
                core.config.rotate_check_interval,
                move || {
                    if let Some(core) = weak.upgrade() {
                        core.rotate_all();
                    }
                },
            )?)
        } else {
            None
        };

        info!(
            staging_dir = %core.config.staging_dir.display(),
            strategy = policy.name(),
            prefix = %core.template.as_str(),
            encoding = ?core.config.encoding,
            bucket = %core.config.store.bucket,
            "Spool output started"
        );

        Ok(SpoolOutput {
            core,
            running: RwLock::new(true),
            rotation_timer: Mutex::new(rotation_timer),
            recovery,
        })
    }

    /// Append a batch of encoded records. Records of one key keep their
    /// order. Running out of disk space aborts the rest of the batch.
    pub fn deliver(&self, batch: &[(Event, Bytes)]) -> Result<(), OutputError> {
        let running = self.running.read();
        if !*running {
            return Err(OutputError::Closed);
        }

        // Group by key in first-seen order, one lock acquisition per key
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<&Bytes>> = HashMap::new();
        for (event, encoded) in batch {
            let key = normalize_routing_key(&self.core.template.render(event));
            groups
                .entry(key)
                .or_insert_with_key(|key| {
                    order.push(key.clone());
                    Vec::new()
                })
                .push(encoded);
        }

        for key in &order {
            let records = groups.get(key).map(Vec::as_slice).unwrap_or_default();
            let written = self.core.registry.for_key(key, |guard| {
                let file = guard.current_file();
                records.iter().try_for_each(|record| file.write(record))
            });
            if let Err(e) = written.and_then(|result| result) {
                if e.is_disk_full() {
                    error!(
                        staging_dir = %self.core.config.staging_dir.display(),
                        key = %key,
                        error = %e,
                        "No space left in staging directory"
                    );
                }
                return Err(e.into());
            }
        }

        let mut first_error = None;
        for key in &order {
            if let Err(e) = self.core.rotate_key(key) {
                warn!(key = %key, error = %e, "Rotation check failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Run the rotation check for one key. Returns whether it rotated.
    pub fn rotate_key(&self, key: &str) -> Result<bool, OutputError> {
        Ok(self.core.rotate_key(key)?)
    }

    /// Run the rotation check for every active key. Returns how many rotated.
    pub fn rotate_all(&self) -> usize {
        self.core.rotate_all()
    }

    /// Upload every current file and shut down. Blocks until the upload
    /// queue drained. Idempotent.
    pub fn stop(&self) {
        let mut running = self.running.write();
        if !*running {
            return;
        }
        *running = false;

        if let Some(mut timer) = self.rotation_timer.lock().take() {
            timer.stop();
        }

        let core = &self.core;
        core.registry.for_each(|guard| match guard.current_file().seal() {
            Ok(sealed) => core.ship(sealed),
            Err(e) => error!(key = %guard.key(), error = %e, "Failed to seal staging file at shutdown"),
        });
        core.registry.close();
        core.uploader.close();
        core.store.shutdown();

        info!(stats = ?core.uploader.stats(), "Spool output stopped");
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    pub fn config(&self) -> &OutputConfig {
        &self.core.config
    }

    pub fn policy(&self) -> RotationPolicy {
        self.core.policy
    }

    pub fn active_keys(&self) -> Vec<String> {
        self.core.registry.keys()
    }

    pub fn registry(&self) -> &FileRegistry {
        &self.core.registry
    }

    pub fn uploader_stats(&self) -> UploaderStats {
        self.core.uploader.stats()
    }

    /// What startup recovery did, None when recovery is disabled
    pub fn recovery_stats(&self) -> Option<RecoveryStats> {
        self.recovery
    }
}

impl Drop for SpoolOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

impl OutputCore {
    fn rotate_key(&self, key: &str) -> Result<bool, StagingError> {
        self.registry
            .for_existing_key(key, |guard| self.rotate_if_needed(guard))
            .unwrap_or(Ok(false))
    }

    fn rotate_all(&self) -> usize {
        let mut rotated = 0;
        self.registry.for_each(|guard| match self.rotate_if_needed(guard) {
            Ok(true) => rotated += 1,
            Ok(false) => {}
            Err(e) => warn!(key = %guard.key(), error = %e, "Periodic rotation check failed"),
        });
        if rotated > 0 {
            debug!(rotated, "Periodic rotation check");
        }
        rotated
    }

    fn rotate_if_needed(&self, guard: &mut GeneratorGuard<'_>) -> Result<bool, StagingError> {
        let now = guard.now();
        if !self.policy.check(guard.current_file(), now)? {
            return Ok(false);
        }

        let mut previous = guard.rotate_out()?;
        let sealed = previous.seal()?;
        debug!(
            key = %guard.key(),
            part = guard.part_index() - 1,
            size = sealed.size(),
            strategy = self.policy.name(),
            "Rotated staging file"
        );
        self.ship(sealed);
        Ok(true)
    }

    /// Upload a sealed file and delete it afterwards, or just delete it
    /// when it is empty
    fn ship(&self, sealed: SealedFile) {
        if sealed.is_empty() {
            if let Err(e) = sealed.delete() {
                warn!(path = %sealed.path().display(), error = %e, "Failed to delete empty staging file");
            }
            return;
        }

        let key = sealed.key().to_string();
        if let Err(e) = self.uploader.upload_async(sealed, Some(delete_on_complete())) {
            error!(key = %key, error = %e, "Upload failed, file kept for recovery");
        }
    }
}

/// Create the staging root and prove it is writable
fn prepare_staging_dir(dir: &Path) -> Result<(), ConfigError> {
    let not_writable = |source| ConfigError::StagingDirNotWritable {
        path: dir.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(dir).map_err(not_writable)?;
    let probe = dir.join(format!(".probe-{}", uuid::Uuid::new_v4()));
    std::fs::write(&probe, b"probe").map_err(not_writable)?;
    std::fs::remove_file(&probe).map_err(not_writable)?;
    Ok(())
}
