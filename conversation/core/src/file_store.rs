//! File Store
//!
//! Minimal storage abstraction the event log and snapshots are written to.
//! Paths are relative, `/`-separated and interpreted against the store root.
//!
//! Two implementations ship with the crate:
//!
//! - [`LocalFileStore`]: a directory on disk; writes go to a temporary
//!   sibling first and are renamed into place
//! - [`InMemoryFileStore`]: a map, used when a conversation is not persisted

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use thiserror::Error;
use uuid::Uuid;

/// Errors from a [`FileStore`]
#[derive(Debug, Error)]
pub enum FileStoreError {
    /// Nothing stored at the path
    #[error("file not found: {0}")]
    NotFound(String),

    /// Underlying I/O failure
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being accessed
        path: String,
        /// Cause
        #[source]
        source: io::Error,
    },

    /// Path escapes the store root or names a special component
    #[error("invalid store path: {0}")]
    InvalidPath(String),
}

impl FileStoreError {
    fn io(path: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound(path.to_string())
        } else {
            Self::Io {
                path: path.to_string(),
                source,
            }
        }
    }

    /// Whether the error means the path does not exist
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Storage backend for conversation persistence
pub trait FileStore: Send + Sync + fmt::Debug {
    /// Write (or replace) the file at `path`
    fn write(&self, path: &str, contents: &[u8]) -> Result<(), FileStoreError>;

    /// Read the file at `path` as UTF-8
    fn read(&self, path: &str) -> Result<String, FileStoreError>;

    /// Names (not paths) of the files directly inside `dir`.
    ///
    /// A directory that does not exist lists as empty.
    fn list(&self, dir: &str) -> Result<Vec<String>, FileStoreError>;

    /// Remove the file at `path`
    fn delete(&self, path: &str) -> Result<(), FileStoreError>;

    /// Whether a file exists at `path`
    fn exists(&self, path: &str) -> bool;
}

/// Join a directory and a file name with `/`
#[must_use]
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

// ============================================================================
// Local directory
// ============================================================================

/// A [`FileStore`] rooted at a directory on disk
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    /// Create a store rooted at `root`, creating the directory if needed
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, FileStoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| FileStoreError::io(&root.display().to_string(), e))?;
        Ok(Self { root })
    }

    /// Directory this store writes into
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, FileStoreError> {
        let mut target = self.root.clone();
        for part in path.split('/').filter(|part| !part.is_empty()) {
            if part == "." || part == ".." || part.contains('\\') {
                return Err(FileStoreError::InvalidPath(path.to_string()));
            }
            target.push(part);
        }
        Ok(target)
    }
}

impl FileStore for LocalFileStore {
    fn write(&self, path: &str, contents: &[u8]) -> Result<(), FileStoreError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| FileStoreError::io(path, e))?;
        }

        let tmp = target.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        fs::write(&tmp, contents).map_err(|e| FileStoreError::io(path, e))?;
        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(FileStoreError::io(path, e));
        }
        Ok(())
    }

    fn read(&self, path: &str) -> Result<String, FileStoreError> {
        fs::read_to_string(self.resolve(path)?).map_err(|e| FileStoreError::io(path, e))
    }

    fn list(&self, dir: &str) -> Result<Vec<String>, FileStoreError> {
        let entries = match fs::read_dir(self.resolve(dir)?) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FileStoreError::io(dir, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FileStoreError::io(dir, e))?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete(&self, path: &str) -> Result<(), FileStoreError> {
        fs::remove_file(self.resolve(path)?).map_err(|e| FileStoreError::io(path, e))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_ok_and(|target| target.is_file())
    }
}

// ============================================================================
// In memory
// ============================================================================

/// A [`FileStore`] kept entirely in memory
#[derive(Debug, Default)]
pub struct InMemoryFileStore {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryFileStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored files
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    /// Whether nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl FileStore for InMemoryFileStore {
    fn write(&self, path: &str, contents: &[u8]) -> Result<(), FileStoreError> {
        self.files.write().insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    fn read(&self, path: &str) -> Result<String, FileStoreError> {
        let files = self.files.read();
        let bytes = files
            .get(path)
            .ok_or_else(|| FileStoreError::NotFound(path.to_string()))?;
        String::from_utf8(bytes.clone())
            .map_err(|e| FileStoreError::io(path, io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    fn list(&self, dir: &str) -> Result<Vec<String>, FileStoreError> {
        let prefix = join(dir, "");
        Ok(self
            .files
            .read()
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    fn delete(&self, path: &str) -> Result<(), FileStoreError> {
        self.files
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| FileStoreError::NotFound(path.to_string()))
    }

    fn exists(&self, path: &str) -> bool {
        self.files.read().contains_key(path)
    }
}
