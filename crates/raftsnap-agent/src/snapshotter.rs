//! The snapshot scheduler.
//!
//! [`Snapshotter`] serialises snapshot runs and reconfiguration behind one
//! async mutex: a run in progress is never torn apart by a configuration
//! change, and a change applied mid-wait adjusts the next fire time through
//! the deadline channel every [`SnapshotTimer`] watches.

use std::fmt;
use std::time::Duration;

use tokio::io::AsyncWriteExt as _;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use raftsnap_upload::{
    create_uploaders, SnapshotFile, SnapshotUploader, UploadError, UploaderError,
};
use raftsnap_vault::{ClientError, VaultClient};

use crate::config::{Config, SnapshotsConfig};

/// Errors from building a client and uploaders out of a configuration,
/// at startup or during a reload.
#[derive(Debug, thiserror::Error)]
pub enum ReconfigureError {
    #[error(transparent)]
    Vault(#[from] raftsnap_vault::ConfigError),

    #[error(transparent)]
    Uploaders(#[from] UploaderError),
}

/// Upload failures of a single snapshot run, one per failed destination.
#[derive(Debug)]
pub struct UploadFailures {
    failures: Vec<UploadError>,
}

impl UploadFailures {
    /// The per-destination failures.
    #[must_use]
    pub fn failures(&self) -> &[UploadError] {
        &self.failures
    }
}

impl fmt::Display for UploadFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, failure) in self.failures.iter().enumerate() {
            if index > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for UploadFailures {}

/// Errors from a single snapshot run.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("unable to create temporary snapshot file: {0}")]
    TempFile(#[source] std::io::Error),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("snapshot was not completed within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("snapshot run was cancelled")]
    Cancelled,

    #[error("unable to stage snapshot for upload: {0}")]
    Stage(#[source] std::io::Error),

    #[error("uploading snapshot failed: {0}")]
    Upload(#[source] UploadFailures),
}

impl SnapshotError {
    /// Whether the run was skipped because this node is not the leader.
    #[must_use]
    pub fn is_not_leader(&self) -> bool {
        matches!(self, Self::Client(client) if client.is_not_leader())
    }
}

/// A handle on the scheduler's next fire time.
///
/// The timer tracks the deadline channel, so a reconfiguration that moves
/// the next fire time reshapes a wait already in progress. This replaces
/// stop-and-drain timer juggling: there is nothing to drain, receivers
/// simply observe the newest deadline.
#[derive(Debug)]
pub struct SnapshotTimer {
    deadline: watch::Receiver<Instant>,
}

impl SnapshotTimer {
    fn new(deadline: watch::Receiver<Instant>) -> Self {
        Self { deadline }
    }

    /// Complete once the current deadline has passed.
    pub async fn fired(mut self) {
        loop {
            let deadline = *self.deadline.borrow_and_update();
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    match self.deadline.has_changed() {
                        // Rearmed while we slept; pick up the new deadline.
                        Ok(true) => {}
                        Ok(false) | Err(_) => return,
                    }
                }
                changed = self.deadline.changed() => {
                    if changed.is_err() {
                        // Scheduler is gone; honor the last deadline.
                        tokio::time::sleep_until(*self.deadline.borrow()).await;
                        return;
                    }
                }
            }
        }
    }
}

struct SnapshotterState {
    config: SnapshotsConfig,
    client: VaultClient,
    uploaders: Vec<Box<dyn SnapshotUploader>>,
    last_snapshot_at: Option<Instant>,
}

/// Periodic, serialised snapshot driver.
pub struct Snapshotter {
    state: Mutex<SnapshotterState>,
    deadline: watch::Sender<Instant>,
}

impl Snapshotter {
    /// Build the snapshotter from a full configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ReconfigureError`] when the client or an uploader cannot
    /// be constructed.
    pub async fn create(config: &Config) -> Result<Self, ReconfigureError> {
        let client = VaultClient::create(&config.vault)?;
        let uploaders = create_uploaders(&config.uploaders).await?;
        Ok(Self::new(config.snapshots.clone(), client, uploaders))
    }

    /// Assemble a snapshotter from parts.
    #[must_use]
    pub fn new(
        config: SnapshotsConfig,
        client: VaultClient,
        uploaders: Vec<Box<dyn SnapshotUploader>>,
    ) -> Self {
        let (deadline, _) = watch::channel(Instant::now());
        Self {
            state: Mutex::new(SnapshotterState {
                config,
                client,
                uploaders,
                last_snapshot_at: None,
            }),
            deadline,
        }
    }

    /// Rebuild the client and uploaders from a new configuration and apply
    /// it. The old configuration stays in effect when this fails.
    ///
    /// # Errors
    ///
    /// Returns [`ReconfigureError`] when the client or an uploader cannot
    /// be constructed.
    pub async fn reconfigure(&self, config: &Config) -> Result<(), ReconfigureError> {
        let client = VaultClient::create(&config.vault)?;
        let uploaders = create_uploaders(&config.uploaders).await?;
        self.configure(config.snapshots.clone(), client, uploaders)
            .await;
        Ok(())
    }

    /// Atomically replace client, uploaders, and timing. Waits for a run in
    /// progress; swapping the client mid-snapshot would invalidate the auth
    /// lease in use.
    ///
    /// The next fire time is recomputed from the previous run under the new
    /// frequency: shortening the frequency fires sooner (immediately when
    /// the new interval has already elapsed), lengthening it preserves the
    /// elapsed part of the current wait.
    pub async fn configure(
        &self,
        config: SnapshotsConfig,
        client: VaultClient,
        uploaders: Vec<Box<dyn SnapshotUploader>>,
    ) {
        let mut state = self.state.lock().await;
        state.config = config;
        state.client = client;
        state.uploaders = uploaders;

        if let Some(last_snapshot_at) = state.last_snapshot_at {
            let next_fire = last_snapshot_at + state.config.frequency;
            self.deadline.send_replace(next_fire.max(Instant::now()));
        }
    }

    /// A timer observing the scheduler's current deadline.
    #[must_use]
    pub fn timer(&self) -> SnapshotTimer {
        SnapshotTimer::new(self.deadline.subscribe())
    }

    /// Run one snapshot cycle: stream a snapshot from the leader into a
    /// temporary file and hand it to every uploader in turn.
    ///
    /// The returned timer is armed for the configured frequency regardless
    /// of the outcome, so the caller's loop retries on the next cycle.
    pub async fn take_snapshot(
        &self,
        cancel: &CancellationToken,
    ) -> (SnapshotTimer, Result<(), SnapshotError>) {
        let mut state = self.state.lock().await;

        let now = Instant::now();
        state.last_snapshot_at = Some(now);
        self.deadline.send_replace(now + state.config.frequency);
        let timer = self.timer();

        let result = Self::run(&mut state, cancel).await;
        (timer, result)
    }

    async fn run(
        state: &mut SnapshotterState,
        cancel: &CancellationToken,
    ) -> Result<(), SnapshotError> {
        // The temp file is removed when this guard drops, on every exit
        // path of the run.
        let staging = tempfile::NamedTempFile::new().map_err(SnapshotError::TempFile)?;
        let mut file =
            tokio::fs::File::from_std(staging.reopen().map_err(SnapshotError::TempFile)?);

        let deadline = Instant::now() + state.config.timeout;

        let streamed = tokio::select! {
            () = cancel.cancelled() => return Err(SnapshotError::Cancelled),
            streamed = tokio::time::timeout_at(deadline, state.client.take_snapshot(&mut file)) => streamed,
        };
        match streamed {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(SnapshotError::Client(err)),
            Err(_elapsed) => {
                return Err(SnapshotError::Timeout {
                    timeout: state.config.timeout,
                })
            }
        }

        file.flush().await.map_err(SnapshotError::Stage)?;
        drop(file);

        let snapshot = SnapshotFile::new(staging.path())
            .await
            .map_err(SnapshotError::Stage)?;
        let timestamp = chrono::Local::now()
            .format(&state.config.timestamp_format)
            .to_string();

        let mut failures = Vec::new();
        for uploader in &state.uploaders {
            let destination = uploader.destination();
            let upload = uploader.upload(
                &snapshot,
                &state.config.name_prefix,
                &timestamp,
                &state.config.name_suffix,
                state.config.retain,
            );

            // Uploads share the run's deadline; a destination overrunning
            // it fails without holding up the rest.
            let uploaded = tokio::select! {
                () = cancel.cancelled() => return Err(SnapshotError::Cancelled),
                uploaded = tokio::time::timeout_at(deadline, upload) => uploaded,
            };

            let failure = match uploaded {
                Ok(Ok(())) => {
                    info!(destination = %destination, "snapshot uploaded");
                    continue;
                }
                Ok(Err(err)) => err,
                Err(_elapsed) => UploadError::Upload {
                    destination: destination.clone(),
                    source: anyhow::anyhow!(
                        "upload was not completed within the snapshot timeout"
                    ),
                },
            };

            error!(destination = %destination, error = %failure, "snapshot upload failed");
            failures.push(failure);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SnapshotError::Upload(UploadFailures { failures }))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    use tokio::io::AsyncWrite;
    use tokio::sync::Notify;

    use raftsnap_vault::auth::{AuthMethod, TokenAuth};
    use raftsnap_vault::{ApiError, VaultApi};

    use super::*;

    #[derive(Default)]
    struct ApiStub {
        leader: bool,
        snapshot_runtime: Duration,
        snapshot_data: &'static str,
        started: Option<Arc<Notify>>,
    }

    #[async_trait::async_trait]
    impl VaultApi for ApiStub {
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
            if let Some(started) = &self.started {
                started.notify_one();
            }
            sink.write_all(self.snapshot_data.as_bytes()).await?;
            tokio::time::sleep(self.snapshot_runtime).await;
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

    fn stub_client(api: ApiStub) -> VaultClient {
        VaultClient::new(
            Box::new(api),
            AuthMethod::Token(TokenAuth::new("test-token".to_owned())),
        )
    }

    #[derive(Default)]
    struct UploadRecord {
        uploaded: AtomicBool,
        data: StdMutex<Option<(String, String, String, Vec<u8>)>>,
    }

    struct UploaderStub {
        record: Arc<UploadRecord>,
        fails: bool,
    }

    impl UploaderStub {
        fn recording(record: &Arc<UploadRecord>) -> Box<dyn SnapshotUploader> {
            Box::new(Self {
                record: Arc::clone(record),
                fails: false,
            })
        }

        fn failing(record: &Arc<UploadRecord>) -> Box<dyn SnapshotUploader> {
            Box::new(Self {
                record: Arc::clone(record),
                fails: true,
            })
        }
    }

    #[async_trait::async_trait]
    impl SnapshotUploader for UploaderStub {
        fn destination(&self) -> String {
            "stub destination".to_owned()
        }

        async fn upload(
            &self,
            snapshot: &SnapshotFile,
            prefix: &str,
            timestamp: &str,
            suffix: &str,
            _retain: usize,
        ) -> Result<(), UploadError> {
            self.record.uploaded.store(true, Ordering::SeqCst);
            if self.fails {
                return Err(UploadError::Upload {
                    destination: self.destination(),
                    source: anyhow::anyhow!("upload failed"),
                });
            }

            let data = tokio::fs::read(snapshot.path())
                .await
                .map_err(|err| UploadError::Upload {
                    destination: self.destination(),
                    source: anyhow::Error::new(err),
                })?;
            *self.record.data.lock().unwrap() = Some((
                prefix.to_owned(),
                timestamp.to_owned(),
                suffix.to_owned(),
                data,
            ));
            Ok(())
        }
    }

    fn config(frequency: Duration, timeout: Duration) -> SnapshotsConfig {
        SnapshotsConfig {
            frequency,
            timeout,
            ..SnapshotsConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_snapshot_runs_are_serialised() {
        let runtime = Duration::from_millis(500);
        let snapshotter = Snapshotter::new(
            config(Duration::from_secs(60), runtime * 3),
            stub_client(ApiStub {
                leader: true,
                snapshot_runtime: runtime,
                ..ApiStub::default()
            }),
            vec![UploaderStub::recording(&Arc::default())],
        );
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let (first, second) = tokio::join!(
            snapshotter.take_snapshot(&cancel),
            snapshotter.take_snapshot(&cancel),
        );

        first.1.unwrap();
        second.1.unwrap();
        assert!(
            start.elapsed() >= runtime * 2,
            "snapshot runs overlapped: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_run_aborts_at_the_timeout() {
        let timeout = Duration::from_secs(1);
        let snapshotter = Snapshotter::new(
            config(Duration::from_secs(60), timeout),
            stub_client(ApiStub {
                leader: true,
                snapshot_runtime: Duration::from_secs(5),
                ..ApiStub::default()
            }),
            vec![UploaderStub::recording(&Arc::default())],
        );
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let (_timer, result) = snapshotter.take_snapshot(&cancel).await;

        assert!(matches!(result, Err(SnapshotError::Timeout { .. })));
        assert!(
            start.elapsed() <= timeout * 2,
            "snapshot run overran the timeout: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn standby_node_skips_the_uploads() {
        let record = Arc::new(UploadRecord::default());
        let snapshotter = Snapshotter::new(
            config(Duration::from_secs(60), Duration::from_secs(1)),
            stub_client(ApiStub {
                leader: false,
                ..ApiStub::default()
            }),
            vec![UploaderStub::recording(&record)],
        );
        let cancel = CancellationToken::new();

        let (_timer, result) = snapshotter.take_snapshot(&cancel).await;

        let err = result.unwrap_err();
        assert!(err.is_not_leader());
        assert!(!record.uploaded.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_data_and_naming_reach_the_uploader() {
        let record = Arc::new(UploadRecord::default());
        let snapshots_config = SnapshotsConfig {
            name_prefix: "test-".to_owned(),
            name_suffix: ".test".to_owned(),
            timestamp_format: "%Y-%m-%dT%H-%M%z".to_owned(),
            ..SnapshotsConfig::default()
        };
        let snapshotter = Snapshotter::new(
            snapshots_config.clone(),
            stub_client(ApiStub {
                leader: true,
                snapshot_data: "test-snapshot",
                ..ApiStub::default()
            }),
            vec![UploaderStub::recording(&record)],
        );
        let cancel = CancellationToken::new();

        let before = chrono::Local::now()
            .format(&snapshots_config.timestamp_format)
            .to_string();
        let (_timer, result) = snapshotter.take_snapshot(&cancel).await;
        let after = chrono::Local::now()
            .format(&snapshots_config.timestamp_format)
            .to_string();

        result.unwrap();
        let (prefix, timestamp, suffix, data) = record.data.lock().unwrap().take().unwrap();
        assert_eq!(prefix, "test-");
        assert_eq!(suffix, ".test");
        assert_eq!(data, b"test-snapshot");
        assert!(
            timestamp == before || timestamp == after,
            "unexpected timestamp {timestamp}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn uploads_continue_when_a_destination_fails() {
        let first = Arc::new(UploadRecord::default());
        let second = Arc::new(UploadRecord::default());
        let snapshotter = Snapshotter::new(
            config(Duration::from_secs(60), Duration::from_secs(1)),
            stub_client(ApiStub {
                leader: true,
                snapshot_data: "payload",
                ..ApiStub::default()
            }),
            vec![UploaderStub::failing(&first), UploaderStub::recording(&second)],
        );
        let cancel = CancellationToken::new();

        let (_timer, result) = snapshotter.take_snapshot(&cancel).await;

        let err = result.unwrap_err();
        match err {
            SnapshotError::Upload(failures) => assert_eq!(failures.failures().len(), 1),
            other => panic!("unexpected error: {other}"),
        }
        assert!(first.uploaded.load(Ordering::SeqCst));
        assert!(second.uploaded.load(Ordering::SeqCst));
        let (_, _, _, data) = second.data.lock().unwrap().take().unwrap();
        assert_eq!(data, b"payload");
    }

    #[tokio::test(start_paused = true)]
    async fn timer_rearms_after_a_successful_run() {
        let snapshotter = Snapshotter::new(
            config(Duration::from_secs(1), Duration::from_secs(60)),
            stub_client(ApiStub {
                leader: true,
                ..ApiStub::default()
            }),
            vec![UploaderStub::recording(&Arc::default())],
        );
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let (timer, result) = snapshotter.take_snapshot(&cancel).await;
        result.unwrap();

        timer.fired().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_rearms_after_a_failed_run() {
        let snapshotter = Snapshotter::new(
            config(Duration::from_secs(1), Duration::from_secs(60)),
            stub_client(ApiStub {
                leader: false,
                ..ApiStub::default()
            }),
            vec![UploaderStub::recording(&Arc::default())],
        );
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let (timer, result) = snapshotter.take_snapshot(&cancel).await;
        assert!(result.is_err());

        timer.fired().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    fn idle_parts() -> (VaultClient, Vec<Box<dyn SnapshotUploader>>) {
        (
            stub_client(ApiStub {
                leader: false,
                ..ApiStub::default()
            }),
            vec![UploaderStub::recording(&Arc::default())],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn lengthening_the_frequency_extends_a_running_wait() {
        let (client, uploaders) = idle_parts();
        let snapshotter = Snapshotter::new(
            config(Duration::from_secs(1), Duration::from_secs(60)),
            client,
            uploaders,
        );
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let (timer, _result) = snapshotter.take_snapshot(&cancel).await;

        let (client, uploaders) = idle_parts();
        snapshotter
            .configure(
                config(Duration::from_secs(2), Duration::from_secs(60)),
                client,
                uploaders,
            )
            .await;

        timer.fired().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn shortening_the_frequency_shortens_a_running_wait() {
        let (client, uploaders) = idle_parts();
        let snapshotter = Snapshotter::new(
            config(Duration::from_secs(1), Duration::from_secs(60)),
            client,
            uploaders,
        );
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let (timer, _result) = snapshotter.take_snapshot(&cancel).await;

        let (client, uploaders) = idle_parts();
        snapshotter
            .configure(
                config(Duration::from_millis(500), Duration::from_secs(60)),
                client,
                uploaders,
            )
            .await;

        timer.fired().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn shortening_the_frequency_past_the_elapsed_wait_fires_immediately() {
        let (client, uploaders) = idle_parts();
        let snapshotter = Snapshotter::new(
            config(Duration::from_secs(1), Duration::from_secs(60)),
            client,
            uploaders,
        );
        let cancel = CancellationToken::new();

        let (timer, _result) = snapshotter.take_snapshot(&cancel).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let (client, uploaders) = idle_parts();
        let reconfigured_at = Instant::now();
        snapshotter
            .configure(
                config(Duration::from_millis(300), Duration::from_secs(60)),
                client,
                uploaders,
            )
            .await;

        timer.fired().await;
        assert!(
            reconfigured_at.elapsed() <= Duration::from_millis(10),
            "timer did not fire immediately: {:?}",
            reconfigured_at.elapsed()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn configure_waits_for_a_run_in_progress() {
        let runtime = Duration::from_millis(500);
        let started = Arc::new(Notify::new());
        let snapshotter = Arc::new(Snapshotter::new(
            config(Duration::from_secs(60), runtime * 3),
            stub_client(ApiStub {
                leader: true,
                snapshot_runtime: runtime,
                started: Some(Arc::clone(&started)),
                ..ApiStub::default()
            }),
            vec![UploaderStub::recording(&Arc::default())],
        ));

        let runner = Arc::clone(&snapshotter);
        let run = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let (_timer, result) = runner.take_snapshot(&cancel).await;
            result
        });

        started.notified().await;
        let start = Instant::now();
        let (client, uploaders) = idle_parts();
        snapshotter
            .configure(
                config(Duration::from_secs(30), Duration::from_secs(60)),
                client,
                uploaders,
            )
            .await;

        assert!(
            start.elapsed() >= runtime - Duration::from_millis(50),
            "configure did not wait for the running snapshot: {:?}",
            start.elapsed()
        );
        run.await.unwrap().unwrap();
    }
}
