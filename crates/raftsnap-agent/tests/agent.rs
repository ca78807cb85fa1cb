//! End-to-end snapshot cycles against a stubbed Vault server and real
//! local destinations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tokio_util::sync::CancellationToken;

use raftsnap_agent::config::SnapshotsConfig;
use raftsnap_agent::snapshotter::{SnapshotError, Snapshotter};
use raftsnap_upload::{
    LocalStorage, LocalUploaderConfig, SnapshotFile, SnapshotUploader, UploadError,
};
use raftsnap_vault::auth::{AuthMethod, TokenAuth};
use raftsnap_vault::{ApiError, VaultApi, VaultClient};

struct VaultStub {
    leader: bool,
    snapshot_data: &'static str,
}

#[async_trait::async_trait]
impl VaultApi for VaultStub {
    fn address(&self) -> &str {
        "http://stub:8200"
    }

    async fn is_leader(&self) -> Result<bool, ApiError> {
        Ok(self.leader)
    }

    async fn take_snapshot(
        &self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), ApiError> {
        sink.write_all(self.snapshot_data.as_bytes()).await?;
        Ok(())
    }

    async fn login(
        &self,
        _path: &str,
        _credentials: serde_json::Value,
    ) -> Result<Duration, ApiError> {
        Ok(Duration::from_secs(3600))
    }

    async fn login_with_token(&self, _token: &str) -> Result<Duration, ApiError> {
        Ok(Duration::from_secs(3600))
    }
}

fn stub_client(leader: bool, snapshot_data: &'static str) -> VaultClient {
    VaultClient::new(
        Box::new(VaultStub {
            leader,
            snapshot_data,
        }),
        AuthMethod::Token(TokenAuth::new("test-token".to_owned())),
    )
}

fn local_uploader(dir: &tempfile::TempDir) -> Box<dyn SnapshotUploader> {
    Box::new(
        LocalStorage::create(&LocalUploaderConfig {
            path: dir.path().to_path_buf(),
        })
        .unwrap(),
    )
}

struct FailingUploader {
    uploaded: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl SnapshotUploader for FailingUploader {
    fn destination(&self) -> String {
        "failing destination".to_owned()
    }

    async fn upload(
        &self,
        _snapshot: &SnapshotFile,
        _prefix: &str,
        _timestamp: &str,
        _suffix: &str,
        _retain: usize,
    ) -> Result<(), UploadError> {
        self.uploaded.store(true, Ordering::SeqCst);
        Err(UploadError::Upload {
            destination: self.destination(),
            source: anyhow::anyhow!("destination is down"),
        })
    }
}

fn snapshots_config(frequency: Duration, retain: usize) -> SnapshotsConfig {
    SnapshotsConfig {
        frequency,
        retain,
        ..SnapshotsConfig::default()
    }
}

#[tokio::test]
async fn one_cycle_stores_a_named_snapshot_locally() {
    let dir = tempfile::tempdir().unwrap();
    let snapshotter = Snapshotter::new(
        snapshots_config(Duration::from_secs(1), 0),
        stub_client(true, "hello"),
        vec![local_uploader(&dir)],
    );
    let cancel = CancellationToken::new();

    let (_timer, result) = snapshotter.take_snapshot(&cancel).await;
    result.unwrap();

    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap())
        .collect();
    assert_eq!(entries.len(), 1);

    let name = entries[0].file_name().to_string_lossy().into_owned();
    assert!(name.starts_with("raft-snapshot-"), "bad name: {name}");
    assert!(name.ends_with(".snap"), "bad name: {name}");
    // A timestamp must sit between prefix and suffix.
    assert!(name.len() > "raft-snapshot-".len() + ".snap".len());

    assert_eq!(std::fs::read(entries[0].path()).unwrap(), b"hello");
}

#[tokio::test]
async fn standby_node_stores_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let snapshotter = Snapshotter::new(
        snapshots_config(Duration::from_secs(1), 0),
        stub_client(false, "hello"),
        vec![local_uploader(&dir)],
    );
    let cancel = CancellationToken::new();

    let (_timer, result) = snapshotter.take_snapshot(&cancel).await;

    assert!(result.unwrap_err().is_not_leader());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn failing_destination_does_not_block_the_next_one() {
    let dir = tempfile::tempdir().unwrap();
    let failed = Arc::new(AtomicBool::new(false));
    let snapshotter = Snapshotter::new(
        snapshots_config(Duration::from_secs(1), 0),
        stub_client(true, "payload"),
        vec![
            Box::new(FailingUploader {
                uploaded: Arc::clone(&failed),
            }),
            local_uploader(&dir),
        ],
    );
    let cancel = CancellationToken::new();

    let (_timer, result) = snapshotter.take_snapshot(&cancel).await;

    assert!(matches!(result, Err(SnapshotError::Upload(_))));
    assert!(failed.load(Ordering::SeqCst));

    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap())
        .collect();
    assert_eq!(entries.len(), 1, "second destination missed the snapshot");
    assert_eq!(std::fs::read(entries[0].path()).unwrap(), b"payload");
}

#[tokio::test]
async fn retention_window_is_enforced_across_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let snapshotter = Snapshotter::new(
        SnapshotsConfig {
            frequency: Duration::from_secs(1),
            retain: 2,
            // Second-granular stamps plus mtimes need unique seconds.
            timestamp_format: "%Y-%m-%dT%H-%M-%S%z".to_owned(),
            ..SnapshotsConfig::default()
        },
        stub_client(true, "cycle"),
        vec![local_uploader(&dir)],
    );
    let cancel = CancellationToken::new();

    let mut seen = std::collections::BTreeSet::new();
    for _ in 0..4 {
        let (_timer, result) = snapshotter.take_snapshot(&cancel).await;
        result.unwrap();
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            seen.insert(entry.unwrap().file_name().to_string_lossy().into_owned());
        }
        tokio::time::sleep(Duration::from_millis(1100)).await;
    }

    let mut kept: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    kept.sort();

    assert_eq!(seen.len(), 4, "expected four distinct snapshot names");
    // The zero-padded timestamp format sorts chronologically, so the two
    // lexically largest names are the two newest snapshots.
    let newest: Vec<String> = seen.iter().rev().take(2).rev().cloned().collect();
    assert_eq!(kept, newest);
}
