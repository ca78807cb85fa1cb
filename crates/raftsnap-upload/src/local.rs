//! Local filesystem destination.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::Context as _;
use serde::Deserialize;

use crate::snapshot_file::SnapshotFile;
use crate::uploader::Uploader;
use crate::{SnapshotStorage, UploaderError};

/// Configuration for the local filesystem destination.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalUploaderConfig {
    /// Directory snapshots are written into. Must exist.
    pub path: PathBuf,
}

/// Stores snapshots as plain files in a directory.
#[derive(Debug)]
pub struct LocalStorage {
    dir: PathBuf,
}

/// A snapshot file found in the destination directory.
pub struct LocalSnapshot {
    path: PathBuf,
    modified: SystemTime,
}

impl LocalStorage {
    /// Create an uploader writing into the configured directory.
    ///
    /// # Errors
    ///
    /// Returns [`UploaderError::Destination`] if the directory does not
    /// exist or is not a directory.
    pub fn create(config: &LocalUploaderConfig) -> Result<Uploader<Self>, UploaderError> {
        let destination = format!("local path {}", config.path.display());

        match std::fs::metadata(&config.path) {
            Ok(meta) if meta.is_dir() => Ok(Uploader::new(Self {
                dir: config.path.clone(),
            })),
            Ok(_) => Err(UploaderError::Destination {
                destination,
                source: anyhow::anyhow!("not a directory"),
            }),
            Err(err) => Err(UploaderError::Destination {
                destination,
                source: anyhow::Error::new(err),
            }),
        }
    }
}

#[async_trait::async_trait]
impl SnapshotStorage for LocalStorage {
    type Snapshot = LocalSnapshot;

    fn destination(&self) -> String {
        format!("local path {}", self.dir.display())
    }

    async fn upload_snapshot(&self, name: &str, snapshot: &SnapshotFile) -> anyhow::Result<()> {
        let target = self.dir.join(name);
        let mut source = snapshot.open().await.context("opening staged snapshot")?;
        let mut file = tokio::fs::File::create(&target)
            .await
            .with_context(|| format!("creating {}", target.display()))?;

        tokio::io::copy(&mut source, &mut file)
            .await
            .with_context(|| format!("writing {}", target.display()))?;

        file.sync_all()
            .await
            .with_context(|| format!("syncing {}", target.display()))?;

        Ok(())
    }

    async fn list_snapshots(
        &self,
        prefix: &str,
        suffix: &str,
    ) -> anyhow::Result<Vec<LocalSnapshot>> {
        let mut snapshots = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("reading {}", self.dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(prefix) || !name.ends_with(suffix) {
                continue;
            }

            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }

            snapshots.push(LocalSnapshot {
                path: entry.path(),
                modified: meta.modified()?,
            });
        }

        Ok(snapshots)
    }

    async fn delete_snapshot(&self, snapshot: &LocalSnapshot) -> anyhow::Result<()> {
        tokio::fs::remove_file(&snapshot.path)
            .await
            .with_context(|| format!("removing {}", snapshot.path.display()))?;
        Ok(())
    }

    fn compare_snapshots(a: &LocalSnapshot, b: &LocalSnapshot) -> Ordering {
        a.modified.cmp(&b.modified)
    }
}
