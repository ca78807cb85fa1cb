//! Azure Blob Storage destination.

use std::cmp::Ordering;
use std::num::NonZeroU32;

use anyhow::Context as _;
use azure_storage::{CloudLocation, StorageCredentials};
use azure_storage_blobs::blob::{BlobBlockType, BlockList};
use azure_storage_blobs::container::operations::BlobItem;
use azure_storage_blobs::prelude::{BlockId, ClientBuilder, ContainerClient};
use futures::{StreamExt as _, TryStreamExt as _};
use serde::Deserialize;
use tokio::io::AsyncReadExt as _;

use crate::snapshot_file::SnapshotFile;
use crate::uploader::Uploader;
use crate::{SnapshotStorage, UploaderError};

/// Blobs are uploaded in blocks of this size.
const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Blocks in flight at once during an upload.
const UPLOAD_CONCURRENCY: usize = 16;

/// Listing page size.
const LIST_PAGE_SIZE: u32 = 500;

/// Configuration for the Azure Blob Storage destination.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AzureUploaderConfig {
    pub account_name: String,
    pub account_key: String,
    #[serde(rename = "container")]
    pub container_name: String,
    /// Blob endpoint domain for sovereign clouds
    /// (e.g. `blob.core.chinacloudapi.cn`); the public cloud applies when
    /// absent.
    #[serde(default)]
    pub cloud_domain: Option<String>,
}

/// Reads the next upload block from the staged snapshot file.
async fn read_next_block(
    mut source: tokio::fs::File,
) -> anyhow::Result<Option<(Vec<u8>, tokio::fs::File)>> {
    let mut block = Vec::with_capacity(BLOCK_SIZE);
    let read = (&mut source)
        .take(BLOCK_SIZE as u64)
        .read_to_end(&mut block)
        .await
        .context("reading staged snapshot")?;
    if read == 0 {
        Ok(None)
    } else {
        Ok(Some((block, source)))
    }
}

/// Stores snapshots as block blobs in an Azure container.
pub struct AzureStorage {
    container_client: ContainerClient,
    container: String,
}

impl AzureStorage {
    /// Create an uploader targeting the configured container.
    ///
    /// The client signs requests lazily; credential problems surface on the
    /// first call.
    ///
    /// # Errors
    ///
    /// Returns [`UploaderError::Destination`] when the shared-key credential
    /// cannot be constructed.
    pub fn create(config: &AzureUploaderConfig) -> Result<Uploader<Self>, UploaderError> {
        let credentials = StorageCredentials::access_key(
            config.account_name.clone(),
            config.account_key.clone(),
        );

        let builder = match &config.cloud_domain {
            Some(domain) => ClientBuilder::with_location(
                CloudLocation::Custom {
                    account: config.account_name.clone(),
                    uri: format!("https://{}.{domain}", config.account_name),
                },
                credentials,
            ),
            None => ClientBuilder::new(config.account_name.clone(), credentials),
        };

        Ok(Uploader::new(Self {
            container_client: builder.container_client(config.container_name.clone()),
            container: config.container_name.clone(),
        }))
    }
}

#[async_trait::async_trait]
impl SnapshotStorage for AzureStorage {
    type Snapshot = azure_storage_blobs::blob::Blob;

    fn destination(&self) -> String {
        format!("azure blob container {}", self.container)
    }

    async fn upload_snapshot(&self, name: &str, snapshot: &SnapshotFile) -> anyhow::Result<()> {
        let blob_client = self.container_client.blob_client(name);

        if snapshot.is_empty() {
            blob_client
                .put_block_blob(Vec::new())
                .await
                .context("putting empty blob")?;
            return Ok(());
        }

        let source = snapshot.open().await.context("opening staged snapshot")?;

        // The file is read sequentially, but up to UPLOAD_CONCURRENCY blocks
        // are put in flight at once; the committed block list restores file
        // order afterwards.
        let blocks = futures::stream::try_unfold(source, read_next_block);

        let mut committed: Vec<(usize, BlockId)> = {
            let blob_client = &blob_client;
            blocks
                .enumerate()
                .map(|(index, block): (usize, anyhow::Result<Vec<u8>>)| async move {
                    let block = block?;
                    // Block ids must share a common length within one blob.
                    let block_id = BlockId::new(format!("{index:032}"));
                    blob_client
                        .put_block(block_id.clone(), block)
                        .await
                        .with_context(|| format!("putting block {index} of blob {name}"))?;
                    Ok::<_, anyhow::Error>((index, block_id))
                })
                .buffer_unordered(UPLOAD_CONCURRENCY)
                .try_collect()
                .await?
        };

        committed.sort_unstable_by_key(|(index, _)| *index);
        let block_list = BlockList {
            blocks: committed
                .into_iter()
                .map(|(_, block_id)| BlobBlockType::Uncommitted(block_id))
                .collect(),
        };

        blob_client
            .put_block_list(block_list)
            .await
            .with_context(|| format!("committing block list of blob {name}"))?;

        Ok(())
    }

    async fn list_snapshots(
        &self,
        prefix: &str,
        suffix: &str,
    ) -> anyhow::Result<Vec<Self::Snapshot>> {
        let mut snapshots = Vec::new();
        let max_results = NonZeroU32::new(LIST_PAGE_SIZE)
            .context("listing page size must be non-zero")?;

        let mut pages = self
            .container_client
            .list_blobs()
            .prefix(prefix.to_owned())
            .max_results(max_results)
            .into_stream();

        while let Some(page) = pages.next().await {
            let page = page.context("listing blobs")?;
            for item in page.blobs.items {
                if let BlobItem::Blob(blob) = item {
                    if blob.name.starts_with(prefix) && blob.name.ends_with(suffix) {
                        snapshots.push(blob);
                    }
                }
            }
        }

        Ok(snapshots)
    }

    async fn delete_snapshot(&self, snapshot: &Self::Snapshot) -> anyhow::Result<()> {
        self.container_client
            .blob_client(&snapshot.name)
            .delete()
            .await
            .with_context(|| format!("deleting blob {}", snapshot.name))?;
        Ok(())
    }

    fn compare_snapshots(a: &Self::Snapshot, b: &Self::Snapshot) -> Ordering {
        a.properties.last_modified.cmp(&b.properties.last_modified)
    }
}
