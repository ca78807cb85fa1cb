//! AWS S3 (and S3-compatible) destination.

use std::cmp::Ordering;

use anyhow::Context as _;
use aws_config::BehaviorVersion;
use aws_config::Region;
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;
use aws_sdk_s3::Client;
use aws_smithy_types::DateTime;
use serde::Deserialize;

use crate::snapshot_file::SnapshotFile;
use crate::uploader::Uploader;
use crate::{SnapshotStorage, UploaderError};

/// Configuration for the S3 destination.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct S3UploaderConfig {
    /// Target bucket.
    pub bucket: String,
    /// Optional key prefix; stored keys become `{keyPrefix}/{name}`.
    #[serde(default)]
    pub key_prefix: String,
    /// Custom endpoint for S3-compatible stores (e.g. MinIO).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Request AES256 server-side encryption on upload.
    #[serde(default)]
    pub use_server_side_encryption: bool,
    /// Use path-style addressing, required by most S3-compatible stores.
    #[serde(default)]
    pub force_path_style: bool,
    /// Static credentials; the default provider chain applies when absent.
    #[serde(default)]
    pub credentials: Option<S3CredentialsConfig>,
}

/// Static credentials for the S3 destination.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct S3CredentialsConfig {
    pub key: String,
    pub secret: String,
}

/// Stores snapshots as objects in an S3 bucket.
pub struct S3Storage {
    client: Client,
    bucket: String,
    key_prefix: String,
    sse: bool,
}

/// An object listing entry in the bucket.
pub struct S3Snapshot {
    key: String,
    last_modified: Option<DateTime>,
}

impl S3Storage {
    /// Create an uploader targeting the configured bucket.
    ///
    /// The signed client is built lazily by the SDK; credential problems
    /// surface on the first call.
    ///
    /// # Errors
    ///
    /// Returns [`UploaderError::Destination`] when the SDK configuration
    /// cannot be assembled.
    pub async fn create(config: &S3UploaderConfig) -> Result<Uploader<Self>, UploaderError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }

        if let Some(credentials) = &config.credentials {
            loader = loader.credentials_provider(Credentials::new(
                credentials.key.clone(),
                credentials.secret.clone(),
                None,
                None,
                "raftsnap-config",
            ));
        }

        let sdk_config = loader.load().await;

        let mut builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(config.force_path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let key_prefix = if config.key_prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", config.key_prefix.trim_end_matches('/'))
        };

        Ok(Uploader::new(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            key_prefix,
            sse: config.use_server_side_encryption,
        }))
    }
}

#[async_trait::async_trait]
impl SnapshotStorage for S3Storage {
    type Snapshot = S3Snapshot;

    fn destination(&self) -> String {
        format!("aws s3 bucket {}", self.bucket)
    }

    async fn upload_snapshot(&self, name: &str, snapshot: &SnapshotFile) -> anyhow::Result<()> {
        let key = format!("{}{}", self.key_prefix, name);
        let body = ByteStream::from_path(snapshot.path())
            .await
            .context("opening staged snapshot")?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body);

        if self.sse {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        }

        request
            .send()
            .await
            .with_context(|| format!("putting object {key}"))?;

        Ok(())
    }

    async fn list_snapshots(&self, prefix: &str, suffix: &str) -> anyhow::Result<Vec<S3Snapshot>> {
        let full_prefix = format!("{}{}", self.key_prefix, prefix);
        let mut snapshots = Vec::new();

        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&full_prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.context("listing objects")?;
            for object in page.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                if !key.starts_with(&full_prefix) || !key.ends_with(suffix) {
                    continue;
                }
                snapshots.push(S3Snapshot {
                    key: key.to_owned(),
                    last_modified: object.last_modified().cloned(),
                });
            }
        }

        Ok(snapshots)
    }

    async fn delete_snapshot(&self, snapshot: &S3Snapshot) -> anyhow::Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&snapshot.key)
            .send()
            .await
            .with_context(|| format!("deleting object {}", snapshot.key))?;
        Ok(())
    }

    fn compare_snapshots(a: &S3Snapshot, b: &S3Snapshot) -> Ordering {
        let stamp = |s: &S3Snapshot| {
            s.last_modified
                .map(|dt| (dt.secs(), dt.subsec_nanos()))
                .unwrap_or((i64::MIN, 0))
        };
        stamp(a).cmp(&stamp(b))
    }
}
