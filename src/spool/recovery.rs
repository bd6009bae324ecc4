//! Crash Recovery
//!
//! Re-uploads staging files left behind by a previous run. Every regular
//! file at depth two or more below the staging root was ours:
//!
//! ```text
//! {root}/{temp dir}/{remote key...}
//! ```
//!
//! The remote key is the path after the temp dir, so no extra state is
//! needed to resume. Files directly under the root are not ours and are
//! left alone.

use crate::spool::staging_file::{SealedFile, StagingError};
use crate::spool::uploader::{CompletionCallback, Uploader};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Non-empty files handed to the uploader
    pub queued: usize,
    pub bytes_queued: u64,
    /// Empty files deleted without uploading
    pub deleted_empty: usize,
    /// Entries directly under the root that are not directories
    pub skipped: usize,
    /// Files that could not be recovered this time
    pub failed: usize,
    /// Empty directories removed
    pub pruned_dirs: usize,
}

/// Queue every leftover staging file under `root` for upload
pub fn recover_staging_dir(root: &Path, uploader: &Uploader) -> Result<RecoveryStats, StagingError> {
    let mut stats = RecoveryStats::default();

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();

        if !file_type.is_dir() {
            debug!(path = %path.display(), "Ignoring entry outside any temp dir");
            stats.skipped += 1;
            continue;
        }

        let mut files = Vec::new();
        collect_files(&path, &mut files)?;
        for file in files {
            recover_file(&file, root, uploader, &mut stats);
        }
        stats.pruned_dirs += prune_empty_dirs(&path);
    }

    info!(
        root = %root.display(),
        queued = stats.queued,
        bytes = stats.bytes_queued,
        deleted_empty = stats.deleted_empty,
        failed = stats.failed,
        "Staging directory recovery finished"
    );
    Ok(stats)
}

fn recover_file(path: &Path, root: &Path, uploader: &Uploader, stats: &mut RecoveryStats) {
    let sealed = match SealedFile::from_existing(path, root) {
        Ok(sealed) => sealed,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot recover staging file");
            stats.failed += 1;
            return;
        }
    };

    if sealed.is_empty() {
        match remove_file_and_parents(sealed.path(), sealed.temp_dir()) {
            Ok(()) => stats.deleted_empty += 1,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to delete empty staging file");
                stats.failed += 1;
            }
        }
        return;
    }

    let size = sealed.size();
    let key = sealed.key().to_string();
    debug!(key = %key, size, "Recovering staging file");
    match uploader.upload_async(sealed, Some(remove_on_complete())) {
        Ok(()) => {
            stats.queued += 1;
            stats.bytes_queued += size;
        }
        Err(e) => {
            warn!(key = %key, error = %e, "Recovery upload failed, file kept for next start");
            stats.failed += 1;
        }
    }
}

/// Remove only the uploaded file, then any directories it leaves empty up
/// to its temp dir. Sibling files in the same tree are still queued.
fn remove_on_complete() -> CompletionCallback {
    Box::new(|file: &SealedFile| {
        remove_file_and_parents(file.path(), file.temp_dir())?;
        Ok(())
    })
}

fn remove_file_and_parents(path: &Path, stop_at: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let mut dir = path.parent();
    while let Some(current) = dir {
        if !current.starts_with(stop_at) {
            break;
        }
        // Stops at the first non-empty directory
        if std::fs::remove_dir(current).is_err() {
            break;
        }
        if current == stop_at {
            break;
        }
        dir = current.parent();
    }
    Ok(())
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), files)?;
        } else if file_type.is_file() {
            files.push(entry.path());
        }
    }
    Ok(())
}

/// Remove empty directories bottom-up, including `dir` itself
fn prune_empty_dirs(dir: &Path) -> usize {
    let mut removed = 0;
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                removed += prune_empty_dirs(&entry.path());
            }
        }
    }
    if std::fs::remove_dir(dir).is_ok() {
        removed += 1;
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spool::clock::Timestamp;
    use crate::spool::config::Encoding;
    use crate::spool::object_store::InMemoryObjectStore;
    use crate::spool::staging_file::StagingFile;
    use crate::spool::uploader::UploaderConfig;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn uploader(store: &InMemoryObjectStore) -> Uploader {
        Uploader::new(
            Arc::new(store.clone()),
            UploaderConfig {
                bucket: "bucket".to_string(),
                server_side_encryption: None,
                workers: 2,
                queue_size: 4,
                retry_delay: Duration::from_millis(1),
                max_attempts: None,
            },
        )
        .unwrap()
    }

    fn leftover(root: &Path, key: &str, data: &[u8]) -> String {
        let mut file = StagingFile::create(root, key, 0, Encoding::None, Timestamp(0)).unwrap();
        file.write(data).unwrap();
        file.close().unwrap();
        file.key().to_string()
    }

    #[test]
    fn test_recovers_files_under_their_keys() {
        let root = TempDir::new().unwrap();
        let a = leftover(root.path(), "logs/a", b"alpha\n");
        let b = leftover(root.path(), "b", b"beta\n");

        let store = InMemoryObjectStore::new();
        let uploader = uploader(&store);
        let stats = recover_staging_dir(root.path(), &uploader).unwrap();
        uploader.close();

        assert_eq!(stats.queued, 2);
        assert_eq!(stats.bytes_queued, 11);
        assert_eq!(&store.get("bucket", &a).unwrap().data[..], b"alpha\n");
        assert_eq!(&store.get("bucket", &b).unwrap().data[..], b"beta\n");
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_empty_files_deleted_not_uploaded() {
        let root = TempDir::new().unwrap();
        leftover(root.path(), "k", b"");

        let store = InMemoryObjectStore::new();
        let uploader = uploader(&store);
        let stats = recover_staging_dir(root.path(), &uploader).unwrap();
        uploader.close();

        assert_eq!(stats.deleted_empty, 1);
        assert_eq!(stats.queued, 0);
        assert!(store.is_empty());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_ignores_top_level_files_and_prunes_empty_dirs() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("foreign.txt"), b"not ours").unwrap();
        std::fs::create_dir_all(root.path().join("empty-uuid/nested")).unwrap();

        let store = InMemoryObjectStore::new();
        let uploader = uploader(&store);
        let stats = recover_staging_dir(root.path(), &uploader).unwrap();
        uploader.close();

        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.pruned_dirs, 2);
        assert!(root.path().join("foreign.txt").exists());
        assert!(!root.path().join("empty-uuid").exists());
        assert!(store.is_empty());
    }

    #[test]
    fn test_siblings_in_one_temp_dir_all_recovered() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("some-uuid").join("k");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("one.data"), b"1").unwrap();
        std::fs::write(dir.join("two.data"), b"22").unwrap();

        let store = InMemoryObjectStore::new();
        let uploader = uploader(&store);
        recover_staging_dir(root.path(), &uploader).unwrap();
        uploader.close();

        assert_eq!(store.keys("bucket"), vec!["k/one.data".to_string(), "k/two.data".to_string()]);
        assert!(!root.path().join("some-uuid").exists());
    }
}
