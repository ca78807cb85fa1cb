//! Snapshot destination abstraction for raftsnap.
//!
//! This crate defines the [`SnapshotStorage`] trait, the four primitives a
//! destination must provide (put, list, delete, compare), and wraps every
//! implementation in one generic [`Uploader`] that owns the shared
//! upload-and-retain algorithm. Retention is therefore implemented exactly
//! once; backends only describe how to talk to their store.
//!
//! Five implementations are provided:
//!
//! - [`LocalStorage`] - a directory on the local filesystem
//! - [`S3Storage`] - AWS S3 and S3-compatible object stores
//! - [`AzureStorage`] - Azure Blob Storage
//! - [`GcsStorage`] - Google Cloud Storage
//! - [`SwiftStorage`] - OpenStack Swift

mod azure;
mod error;
mod gcs;
mod local;
mod s3;
mod snapshot_file;
mod swift;
mod uploader;

use std::cmp::Ordering;

use serde::Deserialize;

pub use azure::{AzureStorage, AzureUploaderConfig};
pub use error::{UploadError, UploaderError};
pub use gcs::{GcsStorage, GcsUploaderConfig};
pub use local::{LocalStorage, LocalUploaderConfig};
pub use s3::{S3CredentialsConfig, S3Storage, S3UploaderConfig};
pub use snapshot_file::SnapshotFile;
pub use swift::{SwiftStorage, SwiftUploaderConfig};
pub use uploader::{SnapshotUploader, Uploader};

/// The primitives a snapshot destination must provide.
///
/// `Snapshot` is the backend's native handle for a stored snapshot (a file
/// stat, an object listing entry, a blob item). The generic [`Uploader`]
/// never inspects it beyond passing it back to [`delete_snapshot`] and
/// ordering it with [`compare_snapshots`].
///
/// Implementations must guarantee that [`list_snapshots`] returns exactly
/// the objects whose name starts with `prefix` and ends with `suffix`.
/// Object stores usually filter by prefix server-side only, so the suffix
/// check has to happen client-side.
///
/// [`delete_snapshot`]: SnapshotStorage::delete_snapshot
/// [`compare_snapshots`]: SnapshotStorage::compare_snapshots
/// [`list_snapshots`]: SnapshotStorage::list_snapshots
#[async_trait::async_trait]
pub trait SnapshotStorage: Send + Sync + 'static {
    /// Backend-native handle for a stored snapshot.
    type Snapshot: Send + Sync;

    /// Human-readable description of the destination, used in errors and logs
    /// (e.g. `aws s3 bucket backups`).
    fn destination(&self) -> String;

    /// Store the snapshot under `name`, overwriting any existing object.
    async fn upload_snapshot(&self, name: &str, snapshot: &SnapshotFile) -> anyhow::Result<()>;

    /// List every stored snapshot whose name starts with `prefix` and ends
    /// with `suffix`. Paged backends must exhaust all pages.
    async fn list_snapshots(
        &self,
        prefix: &str,
        suffix: &str,
    ) -> anyhow::Result<Vec<Self::Snapshot>>;

    /// Delete a single stored snapshot.
    async fn delete_snapshot(&self, snapshot: &Self::Snapshot) -> anyhow::Result<()>;

    /// Order two snapshots by their modification time, ascending.
    fn compare_snapshots(a: &Self::Snapshot, b: &Self::Snapshot) -> Ordering;
}

/// Configuration for all snapshot destinations. Every block is optional;
/// a present block activates the corresponding uploader.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UploadersConfig {
    pub aws: Option<S3UploaderConfig>,
    pub azure: Option<AzureUploaderConfig>,
    pub google: Option<GcsUploaderConfig>,
    pub local: Option<LocalUploaderConfig>,
    pub swift: Option<SwiftUploaderConfig>,
}

impl UploadersConfig {
    /// Whether at least one destination is configured.
    #[must_use]
    pub fn has_uploaders(&self) -> bool {
        self.aws.is_some()
            || self.azure.is_some()
            || self.google.is_some()
            || self.local.is_some()
            || self.swift.is_some()
    }
}

/// Create an uploader for every configured destination.
///
/// The order is fixed (aws, azure, google, local, swift) so that uploads
/// within a snapshot run are observably sequential in that order.
///
/// # Errors
///
/// Returns [`UploaderError::Destination`] when a destination cannot be
/// constructed, e.g. invalid credentials or an unreachable container.
pub async fn create_uploaders(
    config: &UploadersConfig,
) -> Result<Vec<Box<dyn SnapshotUploader>>, UploaderError> {
    let mut uploaders: Vec<Box<dyn SnapshotUploader>> = Vec::new();

    if let Some(aws) = &config.aws {
        uploaders.push(Box::new(S3Storage::create(aws).await?));
    }

    if let Some(azure) = &config.azure {
        uploaders.push(Box::new(AzureStorage::create(azure)?));
    }

    if let Some(google) = &config.google {
        uploaders.push(Box::new(GcsStorage::create(google).await?));
    }

    if let Some(local) = &config.local {
        uploaders.push(Box::new(LocalStorage::create(local)?));
    }

    if let Some(swift) = &config.swift {
        uploaders.push(Box::new(SwiftStorage::create(swift).await?));
    }

    Ok(uploaders)
}
