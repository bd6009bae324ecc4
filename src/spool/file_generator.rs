//! File Generator
//!
//! Owns the current staging file of one routing key. All access to that
//! file goes through `with_exclusive_access`, the only synchronization
//! point for the key: writers, the rotation timer and the stale sweep
//! all take the same lock.

use crate::spool::clock::{Clock, Timestamp};
use crate::spool::config::Encoding;
use crate::spool::staging_file::{StagingError, StagingFile};
use parking_lot::{Mutex, MutexGuard};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Creates staging files under one root with one codec
#[derive(Clone)]
pub struct FileFactory {
    root: PathBuf,
    encoding: Encoding,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FileFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileFactory")
            .field("root", &self.root)
            .field("encoding", &self.encoding)
            .finish()
    }
}

impl FileFactory {
    pub fn new(root: PathBuf, encoding: Encoding, clock: Arc<dyn Clock>) -> Self {
        FileFactory {
            root,
            encoding,
            clock,
        }
    }

    pub fn create(&self, routing_key: &str, part_index: u64) -> Result<StagingFile, StagingError> {
        StagingFile::create(
            &self.root,
            routing_key,
            part_index,
            self.encoding,
            self.clock.now(),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }
}

struct GeneratorState {
    part_index: u64,
    current: StagingFile,
    /// Set by the stale sweep once the generator left the registry
    evicted: bool,
}

/// Per-key owner of the current staging file
pub struct FileGenerator {
    key: String,
    factory: FileFactory,
    state: Mutex<GeneratorState>,
}

impl std::fmt::Debug for FileGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileGenerator")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl FileGenerator {
    /// Create the generator together with part 0
    pub fn new(key: &str, factory: FileFactory) -> Result<Self, StagingError> {
        let current = factory.create(key, 0)?;
        Ok(FileGenerator {
            key: key.to_string(),
            factory,
            state: Mutex::new(GeneratorState {
                part_index: 0,
                current,
                evicted: false,
            }),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Acquire the key's lock. Prefer `with_exclusive_access`.
    pub fn lock(&self) -> GeneratorGuard<'_> {
        GeneratorGuard {
            key: &self.key,
            factory: &self.factory,
            state: self.state.lock(),
        }
    }

    pub fn with_exclusive_access<R>(&self, f: impl FnOnce(&mut GeneratorGuard<'_>) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }
}

/// Exclusive view of a generator, alive for the duration of the lock
pub struct GeneratorGuard<'a> {
    key: &'a str,
    factory: &'a FileFactory,
    state: MutexGuard<'a, GeneratorState>,
}

impl GeneratorGuard<'_> {
    pub fn key(&self) -> &str {
        self.key
    }

    pub fn current_file(&mut self) -> &mut StagingFile {
        &mut self.state.current
    }

    /// Part index of the current file
    pub fn part_index(&self) -> u64 {
        self.state.part_index
    }

    /// Install a fresh file with the next part index and return it.
    ///
    /// The previous file is dropped without being sealed or deleted, so the
    /// caller must seal it first. If the new file cannot be created the
    /// previous one stays current.
    pub fn rotate(&mut self) -> Result<&mut StagingFile, StagingError> {
        drop(self.rotate_out()?);
        Ok(&mut self.state.current)
    }

    /// Install a fresh file with the next part index and hand back the
    /// previous one, still open. On error nothing changes.
    pub fn rotate_out(&mut self) -> Result<StagingFile, StagingError> {
        let next = self.state.part_index.saturating_add(1);
        let file = self.factory.create(self.key, next)?;
        self.state.part_index = next;
        Ok(std::mem::replace(&mut self.state.current, file))
    }

    pub fn now(&self) -> Timestamp {
        self.factory.now()
    }

    pub fn is_evicted(&self) -> bool {
        self.state.evicted
    }

    pub(crate) fn mark_evicted(&mut self) {
        self.state.evicted = true;
    }
}
