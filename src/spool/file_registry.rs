//! File Registry
//!
//! Maps routing keys to their `FileGenerator`s and evicts generators whose
//! file stayed empty for too long.
//!
//! ## Lock order
//!
//! ```text
//! for_key:     map (read, then write on miss) ── released ──> generator
//! sweep_stale:                          generator ──> map (write)
//! ```
//!
//! The map lock is never held while waiting on a generator, so the two
//! paths cannot deadlock. A writer that wins the generator lock after the
//! sweep evicted it sees the evicted flag and looks the key up again.

use crate::spool::clock::Timestamp;
use crate::spool::file_generator::{FileFactory, FileGenerator, GeneratorGuard};
use crate::spool::periodic::PeriodicTask;
use crate::spool::staging_file::StagingError;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct FileRegistry {
    factory: FileFactory,
    stale_file_age: Duration,
    generators: RwLock<HashMap<String, Arc<FileGenerator>>>,
    sweeper: Mutex<Option<PeriodicTask>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for FileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRegistry")
            .field("factory", &self.factory)
            .field("stale_file_age", &self.stale_file_age)
            .field("keys", &self.len())
            .finish()
    }
}

impl FileRegistry {
    pub fn new(factory: FileFactory, stale_file_age: Duration) -> Self {
        FileRegistry {
            factory,
            stale_file_age,
            generators: RwLock::new(HashMap::new()),
            sweeper: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Start sweeping stale generators every `interval`
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> std::io::Result<()> {
        let registry: Weak<FileRegistry> = Arc::downgrade(self);
        let task = PeriodicTask::spawn("spool-stale-sweep", interval, move || {
            if let Some(registry) = registry.upgrade() {
                registry.sweep_stale();
            }
        })?;
        *self.sweeper.lock() = Some(task);
        Ok(())
    }

    /// Run `f` with exclusive access to the generator of `key`, creating the
    /// generator on first use.
    pub fn for_key<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut GeneratorGuard<'_>) -> R,
    ) -> Result<R, StagingError> {
        loop {
            let generator = self.get_or_create(key)?;
            let mut guard = generator.lock();
            if !guard.is_evicted() {
                return Ok(f(&mut guard));
            }
            debug!(key = %key, "Generator evicted while waiting, retrying lookup");
        }
    }

    /// Like `for_key`, but never creates a generator. None when the key
    /// has no live generator.
    pub fn for_existing_key<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut GeneratorGuard<'_>) -> R,
    ) -> Option<R> {
        let generator = self.generators.read().get(key).cloned()?;
        let mut guard = generator.lock();
        if guard.is_evicted() {
            return None;
        }
        Some(f(&mut guard))
    }

    /// Run `f` for every live generator, one key at a time
    pub fn for_each(&self, mut f: impl FnMut(&mut GeneratorGuard<'_>)) {
        for generator in self.snapshot() {
            let mut guard = generator.lock();
            if !guard.is_evicted() {
                f(&mut guard);
            }
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.generators.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.generators.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict every generator whose current file is empty and older than
    /// the stale age. Returns the evicted keys.
    pub fn sweep_stale(&self) -> Vec<String> {
        let mut evicted = Vec::new();

        for generator in self.snapshot() {
            let mut guard = generator.lock();
            if guard.is_evicted() {
                continue;
            }
            let now = guard.now();
            match is_stale(&mut guard, now, self.stale_file_age) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    warn!(key = %guard.key(), error = %e, "Failed to inspect staging file");
                    continue;
                }
            }

            guard.mark_evicted();
            {
                let mut map = self.generators.write();
                if map
                    .get(guard.key())
                    .is_some_and(|current| Arc::ptr_eq(current, &generator))
                {
                    map.remove(guard.key());
                }
            }
            if let Err(e) = guard.current_file().delete() {
                warn!(key = %guard.key(), error = %e, "Failed to delete stale staging file");
            }
            evicted.push(guard.key().to_string());
        }

        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted stale file generators");
        }
        evicted
    }

    /// Stop the sweep timer. Files are left as they are. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let task = self.sweeper.lock().take();
        if let Some(mut task) = task {
            task.stop();
        }
        debug!("File registry closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Vec<Arc<FileGenerator>> {
        self.generators.read().values().cloned().collect()
    }

    fn get_or_create(&self, key: &str) -> Result<Arc<FileGenerator>, StagingError> {
        if let Some(generator) = self.generators.read().get(key) {
            return Ok(generator.clone());
        }

        // File creation happens outside the map lock; a racer that loses
        // the insert removes its own file.
        let created = Arc::new(FileGenerator::new(key, self.factory.clone())?);
        let existing = {
            let mut map = self.generators.write();
            match map.get(key) {
                Some(generator) => Some(generator.clone()),
                None => {
                    map.insert(key.to_string(), created.clone());
                    None
                }
            }
        };

        match existing {
            Some(generator) => {
                if let Err(e) = created.with_exclusive_access(|g| g.current_file().delete()) {
                    warn!(key = %key, error = %e, "Failed to delete unused staging file");
                }
                Ok(generator)
            }
            None => {
                debug!(key = %key, "Created file generator");
                Ok(created)
            }
        }
    }
}

fn is_stale(
    guard: &mut GeneratorGuard<'_>,
    now: Timestamp,
    max_age: Duration,
) -> Result<bool, StagingError> {
    let file = guard.current_file();
    Ok(file.is_empty()? && now.saturating_sub(file.created_at()) > max_age)
}

impl Drop for FileRegistry {
    fn drop(&mut self) {
        self.close();
    }
}
