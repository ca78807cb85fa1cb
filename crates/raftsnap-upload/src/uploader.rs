//! The generic upload-and-retain pipeline shared by all destinations.

use crate::error::UploadError;
use crate::snapshot_file::SnapshotFile;
use crate::SnapshotStorage;

/// Object-safe face of an uploader, as consumed by the snapshot scheduler.
#[async_trait::async_trait]
pub trait SnapshotUploader: Send + Sync {
    /// Human-readable description of the destination.
    fn destination(&self) -> String;

    /// Upload the snapshot as `{prefix}{timestamp}{suffix}` and prune
    /// snapshots beyond the retention window.
    async fn upload(
        &self,
        snapshot: &SnapshotFile,
        prefix: &str,
        timestamp: &str,
        suffix: &str,
        retain: usize,
    ) -> Result<(), UploadError>;
}

/// Wraps a [`SnapshotStorage`] implementation with the shared
/// upload-and-retain algorithm.
#[derive(Debug)]
pub struct Uploader<S: SnapshotStorage> {
    storage: S,
}

impl<S: SnapshotStorage> Uploader<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub(crate) fn storage(&self) -> &S {
        &self.storage
    }
}

#[async_trait::async_trait]
impl<S: SnapshotStorage> SnapshotUploader for Uploader<S> {
    fn destination(&self) -> String {
        self.storage.destination()
    }

    /// Upload, then enforce retention.
    ///
    /// A `retain` of zero keeps every snapshot. Pruning deletes oldest-first
    /// and aborts on the first delete error; deletions already performed are
    /// not rolled back.
    async fn upload(
        &self,
        snapshot: &SnapshotFile,
        prefix: &str,
        timestamp: &str,
        suffix: &str,
        retain: usize,
    ) -> Result<(), UploadError> {
        let destination = self.storage.destination();
        let name = format!("{prefix}{timestamp}{suffix}");

        self.storage
            .upload_snapshot(&name, snapshot)
            .await
            .map_err(|source| UploadError::Upload {
                destination: destination.clone(),
                source,
            })?;

        if retain == 0 {
            return Ok(());
        }

        let mut existing = self
            .storage
            .list_snapshots(prefix, suffix)
            .await
            .map_err(|source| UploadError::Retention {
                destination: destination.clone(),
                source,
            })?;

        if existing.len() <= retain {
            return Ok(());
        }

        // Newest first; everything beyond the window gets deleted.
        existing.sort_by(|a, b| S::compare_snapshots(a, b).reverse());

        for stale in &existing[retain..] {
            self.storage
                .delete_snapshot(stale)
                .await
                .map_err(|source| UploadError::Retention {
                    destination: destination.clone(),
                    source,
                })?;
        }

        Ok(())
    }
}
