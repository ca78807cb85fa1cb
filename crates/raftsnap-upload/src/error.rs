//! Error types for snapshot uploads.

/// Errors from constructing an uploader.
#[derive(Debug, thiserror::Error)]
pub enum UploaderError {
    /// The destination could not be reached or refused the configured
    /// credentials at construction time.
    #[error("destination {destination} is unavailable: {source}")]
    Destination {
        destination: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors from uploading a snapshot to a destination.
///
/// Upload and retention failures are distinct: a retention failure means the
/// snapshot itself was stored successfully and only the pruning of older
/// snapshots failed, so there is no data-loss risk.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Storing the snapshot failed.
    #[error("unable to upload snapshot to {destination}: {source}")]
    Upload {
        destination: String,
        #[source]
        source: anyhow::Error,
    },

    /// The snapshot was stored, but pruning snapshots beyond the retention
    /// window failed.
    #[error("unable to prune old snapshots on {destination}: {source}")]
    Retention {
        destination: String,
        #[source]
        source: anyhow::Error,
    },
}

impl UploadError {
    /// The destination descriptor the error originated from.
    #[must_use]
    pub fn destination(&self) -> &str {
        match self {
            Self::Upload { destination, .. } | Self::Retention { destination, .. } => destination,
        }
    }
}
