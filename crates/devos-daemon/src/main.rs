//! devos-daemon — the orchestrator's background process.
//!
//! Owns the durable pipeline state machine, the handoff coordinator, CLI
//! session lifecycle management, and (when `JIRA_CLIENT_ID`/
//! `JIRA_CLIENT_SECRET` are set) the Jira two-way sync engine. Runs until
//! ctrl-c, at which point it drains its background sweeps and exits.

use devos_core::config::Config;
use devos_daemon::daemon::Daemon;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(pid = std::process::id(), version = env!("CARGO_PKG_VERSION"), "devos-daemon starting");

    let config = Config::from_env();
    let daemon = Daemon::new(config).await?;

    if daemon.oauth().is_some() {
        info!("jira integration configured");
    } else {
        info!("jira integration not configured, running pipeline-only");
    }

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run_loops().await;
    info!("devos-daemon stopped");
    Ok(())
}
