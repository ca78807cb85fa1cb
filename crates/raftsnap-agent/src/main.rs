//! raftsnap agent entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

/// Takes periodic snapshots of Vault's Raft database.
#[derive(Parser)]
#[command(
    name = "raftsnap-agent",
    version,
    about = "takes periodic snapshots of vault's raft database"
)]
struct Cli {
    /// Load configuration from FILE.
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "VAULT_RAFT_SNAPSHOT_AGENT_CONFIG_FILE",
        default_value = "/etc/raftsnap/agent.yaml"
    )]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match raftsnap_agent::run(&cli.config).await {
        // The loop only returns after a terminating signal.
        Ok(()) => ExitCode::from(1),
        Err(err) => {
            error!(error = %err, "startup failed");
            ExitCode::from(2)
        }
    }
}
