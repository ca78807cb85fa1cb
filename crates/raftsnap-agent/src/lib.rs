//! raftsnap agent.
//!
//! A long-running agent that periodically takes a consistent snapshot of
//! Vault's Raft database from the cluster leader and uploads it to one or
//! more destinations, pruning each destination down to its retention
//! window. Configuration can be reloaded live; SIGINT/SIGTERM shut the
//! agent down cleanly.

pub mod config;
pub mod snapshotter;
pub mod watch;

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::snapshotter::{SnapshotError, Snapshotter};

/// Load the configuration, then run snapshot cycles until a terminating
/// signal arrives.
///
/// # Errors
///
/// Returns an error for unrecoverable startup problems: unparseable
/// configuration, no uploaders, or a destination that cannot be
/// constructed.
pub async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    info!(path = %config_path.display(), "configuration loaded");

    let snapshotter = Arc::new(Snapshotter::create(&config).await?);
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let outcomes = watch::watch_config(
        config_path.to_path_buf(),
        Arc::clone(&snapshotter),
        cancel.clone(),
    )?;
    // The watch task logs every outcome itself; just keep the stream alive.
    tokio::spawn(drain_outcomes(outcomes));

    loop {
        let (timer, result) = snapshotter.take_snapshot(&cancel).await;

        match result {
            Ok(()) => info!("snapshot completed"),
            Err(err) if err.is_not_leader() => {
                info!("not running on the raft leader node, skipping");
            }
            Err(SnapshotError::Cancelled) => {}
            Err(err) => error!(error = %err, "snapshot failed"),
        }

        tokio::select! {
            () = timer.fired() => {}
            () = cancel.cancelled() => break,
        }
    }

    info!("shutting down");
    Ok(())
}

async fn drain_outcomes(
    mut outcomes: tokio::sync::mpsc::Receiver<Result<(), watch::ReloadError>>,
) {
    while outcomes.recv().await.is_some() {}
}

/// Cancel the root token on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.ok();
        };

        #[cfg(unix)]
        let terminate = async {
            if let Ok(mut signal) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            {
                signal.recv().await;
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {}
            () = terminate => {}
        }

        info!("received terminating signal");
        cancel.cancel();
    });
}
