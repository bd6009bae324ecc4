//! Staging Files
//!
//! A staging file is one local append-only file plus a write-through codec.
//! It lives in its own uniquely named directory:
//!
//! ```text
//! {staging_root}/{uuid}/{routing_key}/spool.{uuid}.{%Y-%m-%dT%H.%M}.part-{index}.{ext}
//!                └──────┘└────────────────────────────────────────────────────────────┘
//!              temp dir                         remote object key
//! ```
//!
//! The layout is load-bearing: recovery rebuilds the remote key purely from
//! the path relative to the temp dir.

use crate::spool::clock::Timestamp;
use crate::spool::config::Encoding;
use flate2::write::GzEncoder;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

const FILE_PREFIX: &str = "spool";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H.%M";

/// Error type for staging file operations
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staging I/O error: {0}")]
    Io(std::io::Error),
    /// No space left in the staging directory
    #[error("no space left on device: {0}")]
    DiskFull(std::io::Error),
    #[error("staging file {0} is closed")]
    Closed(PathBuf),
    #[error("invalid staging path: {0}")]
    InvalidPath(String),
}

impl StagingError {
    pub fn is_disk_full(&self) -> bool {
        matches!(self, StagingError::DiskFull(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StagingError::Io(e) if e.kind() == ErrorKind::NotFound)
    }
}

impl From<std::io::Error> for StagingError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == ErrorKind::StorageFull {
            StagingError::DiskFull(e)
        } else {
            StagingError::Io(e)
        }
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Write-through codec. The gzip encoder is created on the first non-empty
/// write, so a file that never received data stays zero bytes long.
enum FileWriter {
    Plain(File),
    Gzip {
        pending: Option<File>,
        encoder: Option<GzEncoder<File>>,
    },
}

impl FileWriter {
    fn new(file: File, encoding: Encoding) -> Self {
        match encoding {
            Encoding::None => FileWriter::Plain(file),
            Encoding::Gzip => FileWriter::Gzip {
                pending: Some(file),
                encoder: None,
            },
        }
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            FileWriter::Plain(file) => file.write_all(data),
            FileWriter::Gzip { pending, encoder } => {
                if data.is_empty() {
                    return Ok(());
                }
                if let Some(file) = pending.take() {
                    *encoder = Some(GzEncoder::new(file, flate2::Compression::default()));
                }
                match encoder {
                    Some(encoder) => encoder.write_all(data),
                    None => Err(std::io::Error::other("gzip stream missing")),
                }
            }
        }
    }

    /// Flushes buffered output and reports bytes on disk.
    fn size(&mut self) -> std::io::Result<u64> {
        match self {
            FileWriter::Plain(file) => Ok(file.metadata()?.len()),
            FileWriter::Gzip {
                encoder: Some(encoder),
                ..
            } => {
                encoder.flush()?;
                Ok(encoder.get_ref().metadata()?.len())
            }
            FileWriter::Gzip { encoder: None, .. } => Ok(0),
        }
    }

    fn finish(self) -> std::io::Result<()> {
        match self {
            FileWriter::Plain(mut file) => file.flush(),
            FileWriter::Gzip {
                encoder: Some(encoder),
                ..
            } => encoder.finish()?.flush(),
            FileWriter::Gzip { encoder: None, .. } => Ok(()),
        }
    }
}

// ============================================================================
// StagingFile
// ============================================================================

/// A local file accumulating encoded records for one routing key
pub struct StagingFile {
    path: PathBuf,
    key: String,
    temp_dir: PathBuf,
    created_at: Timestamp,
    writer: Option<FileWriter>,
}

impl std::fmt::Debug for StagingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingFile")
            .field("path", &self.path)
            .field("key", &self.key)
            .field("created_at", &self.created_at)
            .field("closed", &self.writer.is_none())
            .finish()
    }
}

impl StagingFile {
    /// Create a new, empty staging file under `root` for `routing_key`.
    pub fn create(
        root: &Path,
        routing_key: &str,
        part_index: u64,
        encoding: Encoding,
        now: Timestamp,
    ) -> Result<Self, StagingError> {
        let id = uuid::Uuid::new_v4().to_string();
        let file_name = format!(
            "{}.{}.{}.part-{}.{}",
            FILE_PREFIX,
            id,
            now.to_utc().format(TIMESTAMP_FORMAT),
            part_index,
            encoding.extension()
        );
        let key = object_key(routing_key, &file_name);
        let temp_dir = root.join(&id);
        let path = temp_dir.join(&key);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(StagingFile {
            path,
            key,
            temp_dir,
            created_at: now,
            writer: Some(FileWriter::new(file, encoding)),
        })
    }

    /// Append bytes through the codec
    pub fn write(&mut self, data: &[u8]) -> Result<(), StagingError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| StagingError::Closed(self.path.clone()))?;
        writer.write_all(data)?;
        Ok(())
    }

    /// Bytes committed to disk, flushing the codec first
    pub fn size(&mut self) -> Result<u64, StagingError> {
        match self.writer.as_mut() {
            Some(writer) => Ok(writer.size()?),
            None => Ok(std::fs::metadata(&self.path)?.len()),
        }
    }

    pub fn is_empty(&mut self) -> Result<bool, StagingError> {
        Ok(self.size()? == 0)
    }

    /// Finalize the codec and release the handle. Idempotent.
    pub fn close(&mut self) -> Result<(), StagingError> {
        if let Some(writer) = self.writer.take() {
            writer.finish()?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// Close the file and capture an immutable snapshot for upload
    pub fn seal(&mut self) -> Result<SealedFile, StagingError> {
        self.close()?;
        let size = self.size()?;
        Ok(SealedFile {
            path: self.path.clone(),
            key: self.key.clone(),
            temp_dir: self.temp_dir.clone(),
            size,
        })
    }

    /// Remove the file together with its temp dir
    pub fn delete(&mut self) -> Result<(), StagingError> {
        let _ = self.close();
        remove_tree(&self.temp_dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Route further writes to `file`, bypassing the codec
    #[cfg(test)]
    pub(crate) fn swap_handle(&mut self, file: File) {
        self.writer = Some(FileWriter::Plain(file));
    }
}

// ============================================================================
// SealedFile
// ============================================================================

/// A closed staging file, ready to be uploaded and then deleted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedFile {
    path: PathBuf,
    key: String,
    temp_dir: PathBuf,
    size: u64,
}

impl SealedFile {
    /// Rebuild a sealed file from a path left in the staging tree.
    ///
    /// The first component below `root` is the temp dir, the rest is the
    /// remote key.
    pub fn from_existing(path: &Path, root: &Path) -> Result<Self, StagingError> {
        let relative = path
            .strip_prefix(root)
            .map_err(|_| StagingError::InvalidPath(path.display().to_string()))?;

        let mut components = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => components.push(part.to_string_lossy().into_owned()),
                _ => return Err(StagingError::InvalidPath(path.display().to_string())),
            }
        }
        if components.len() < 2 {
            return Err(StagingError::InvalidPath(path.display().to_string()));
        }

        let size = std::fs::metadata(path)?.len();
        Ok(SealedFile {
            path: path.to_path_buf(),
            key: components[1..].join("/"),
            temp_dir: root.join(&components[0]),
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Remove the temp dir. Already-removed trees are fine.
    pub fn delete(&self) -> Result<(), StagingError> {
        remove_tree(&self.temp_dir)
    }
}

fn remove_tree(dir: &Path) -> Result<(), StagingError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Normalize a routing key into a relative path: no leading separator and
/// no empty, `.` or `..` segments.
pub fn normalize_routing_key(routing_key: &str) -> String {
    routing_key
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .collect::<Vec<_>>()
        .join("/")
}

fn object_key(routing_key: &str, file_name: &str) -> String {
    let prefix = normalize_routing_key(routing_key);
    if prefix.is_empty() {
        file_name.to_string()
    } else {
        format!("{}/{}", prefix, file_name)
    }
}
