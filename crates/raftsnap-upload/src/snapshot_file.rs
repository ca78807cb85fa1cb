//! Handle for a snapshot staged on the local filesystem.

use std::path::{Path, PathBuf};

use tokio::fs::File;

/// A snapshot staged in a temporary file, ready to be uploaded.
///
/// Uploads to multiple destinations run sequentially over the same staged
/// file; every backend opens its own read handle so each destination sees
/// the full stream from offset zero.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
    len: u64,
}

impl SnapshotFile {
    /// Wrap an existing file, recording its current length.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be stat'ed.
    pub async fn new(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let len = tokio::fs::metadata(&path).await?.len();
        Ok(Self { path, len })
    }

    /// Path of the staged file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the staged snapshot in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the staged snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Open a fresh read handle positioned at the start of the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open(&self) -> std::io::Result<File> {
        File::open(&self.path).await
    }
}
