//! Configuration hot-reload.
//!
//! A filesystem watcher on the configuration file triggers a re-parse; a
//! valid result reconfigures the snapshotter, an invalid one is logged and
//! ignored so the running configuration stays in effect. Every outcome is
//! published on the returned channel; the watcher itself stays internal.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, ConfigError};
use crate::snapshotter::{ReconfigureError, Snapshotter};

/// Events arriving within this window are folded into one reload.
const SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Why a configuration reload did not take effect.
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Reconfigure(#[from] ReconfigureError),
}

/// Watch the configuration file and reconfigure the snapshotter on change.
///
/// Returns the stream of reload outcomes. The watch stops when `cancel`
/// fires or the returned receiver is dropped together with the event
/// source.
///
/// # Errors
///
/// Returns [`notify::Error`] when the watch cannot be established.
pub fn watch_config(
    path: PathBuf,
    snapshotter: Arc<Snapshotter>,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<Result<(), ReloadError>>, notify::Error> {
    let (event_tx, event_rx) = mpsc::channel::<Result<Event, notify::Error>>(16);
    let mut watcher = notify::recommended_watcher(move |event| {
        let _ = event_tx.blocking_send(event);
    })?;

    // Watch the directory, not the file: editors and orchestrators replace
    // config files instead of rewriting them in place.
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    watcher.watch(&directory, RecursiveMode::NonRecursive)?;

    let (outcome_tx, outcome_rx) = mpsc::channel(16);
    tokio::spawn(run_watch(
        watcher,
        event_rx,
        path,
        snapshotter,
        cancel,
        outcome_tx,
    ));

    Ok(outcome_rx)
}

async fn run_watch(
    watcher: notify::RecommendedWatcher,
    mut events: mpsc::Receiver<Result<Event, notify::Error>>,
    path: PathBuf,
    snapshotter: Arc<Snapshotter>,
    cancel: CancellationToken,
    outcomes: mpsc::Sender<Result<(), ReloadError>>,
) {
    // Dropping the watcher ends the watch; keep it alive for the task's
    // lifetime.
    let _watcher = watcher;

    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        let Some(event) = event else {
            break;
        };

        match event {
            Ok(event) if is_config_change(&event, &path) => {
                // Let bursts of events from a single save settle, then
                // drain whatever queued up meanwhile.
                tokio::time::sleep(SETTLE_DELAY).await;
                while events.try_recv().is_ok() {}

                let outcome = reload(&path, &snapshotter).await;
                match &outcome {
                    Ok(()) => info!(path = %path.display(), "configuration reloaded"),
                    Err(ReloadError::Config(err)) => {
                        warn!(path = %path.display(), error = %err, "ignoring configuration change, file is invalid");
                    }
                    Err(ReloadError::Reconfigure(err)) => {
                        warn!(path = %path.display(), error = %err, "could not apply configuration change, keeping previous configuration");
                    }
                }

                if outcomes.send(outcome).await.is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "configuration watch error"),
        }
    }
}

fn is_config_change(event: &Event, path: &Path) -> bool {
    let mutation = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
    );

    mutation
        && event
            .paths
            .iter()
            .any(|changed| changed.file_name() == path.file_name())
}

async fn reload(path: &Path, snapshotter: &Snapshotter) -> Result<(), ReloadError> {
    let config = Config::load(path)?;
    snapshotter.reconfigure(&config).await?;
    Ok(())
}
