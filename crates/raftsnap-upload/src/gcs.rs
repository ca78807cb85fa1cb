//! Google Cloud Storage destination.

use std::cmp::Ordering;

use anyhow::Context as _;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use google_cloud_storage::http::objects::Object;
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::snapshot_file::SnapshotFile;
use crate::uploader::Uploader;
use crate::{SnapshotStorage, UploaderError};

/// Configuration for the Google Cloud Storage destination.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GcsUploaderConfig {
    /// Target bucket. Credentials are resolved from the environment
    /// (application default credentials).
    pub bucket: String,
}

/// Stores snapshots as objects in a GCS bucket.
pub struct GcsStorage {
    client: Client,
    bucket: String,
}

impl GcsStorage {
    /// Create an uploader targeting the configured bucket.
    ///
    /// # Errors
    ///
    /// Returns [`UploaderError::Destination`] when no application default
    /// credentials can be resolved from the environment.
    pub async fn create(config: &GcsUploaderConfig) -> Result<Uploader<Self>, UploaderError> {
        let client_config = ClientConfig::default().with_auth().await.map_err(|err| {
            UploaderError::Destination {
                destination: format!("gcp bucket {}", config.bucket),
                source: anyhow::Error::new(err),
            }
        })?;

        Ok(Uploader::new(Self {
            client: Client::new(client_config),
            bucket: config.bucket.clone(),
        }))
    }
}

#[async_trait::async_trait]
impl SnapshotStorage for GcsStorage {
    type Snapshot = Object;

    fn destination(&self) -> String {
        format!("gcp bucket {}", self.bucket)
    }

    async fn upload_snapshot(&self, name: &str, snapshot: &SnapshotFile) -> anyhow::Result<()> {
        let source = snapshot.open().await.context("opening staged snapshot")?;

        let mut media = Media::new(name.to_owned());
        media.content_length = Some(snapshot.len());

        self.client
            .upload_streamed_object(
                &UploadObjectRequest {
                    bucket: self.bucket.clone(),
                    ..Default::default()
                },
                ReaderStream::new(source),
                &UploadType::Simple(media),
            )
            .await
            .with_context(|| format!("uploading object {name}"))?;

        Ok(())
    }

    async fn list_snapshots(&self, prefix: &str, suffix: &str) -> anyhow::Result<Vec<Object>> {
        let mut snapshots = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects(&ListObjectsRequest {
                    bucket: self.bucket.clone(),
                    prefix: Some(prefix.to_owned()),
                    page_token: page_token.clone(),
                    ..Default::default()
                })
                .await
                .context("listing objects")?;

            if let Some(items) = response.items {
                snapshots.extend(
                    items
                        .into_iter()
                        .filter(|o| o.name.starts_with(prefix) && o.name.ends_with(suffix)),
                );
            }

            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        Ok(snapshots)
    }

    async fn delete_snapshot(&self, snapshot: &Object) -> anyhow::Result<()> {
        self.client
            .delete_object(&DeleteObjectRequest {
                bucket: self.bucket.clone(),
                object: snapshot.name.clone(),
                ..Default::default()
            })
            .await
            .with_context(|| format!("deleting object {}", snapshot.name))?;
        Ok(())
    }

    fn compare_snapshots(a: &Object, b: &Object) -> Ordering {
        a.updated.cmp(&b.updated)
    }
}
