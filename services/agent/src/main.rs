//! Tether Node Agent
//!
//! Keeps this node's managed attributes converged toward the desired state
//! published by the control plane, and reports the actual state back.

use std::sync::Arc;

use anyhow::Result;
use tether_agent::{
    default_factories, Agent, AgentConfig, HttpControlPlaneClient, LogMetricsReporter,
    ProcessMetricsCollector,
};
use tether_state::{AchieverConfig, SuperController};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AgentConfig::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node_id = %config.node_id,
        control_plane_url = %config.control_plane_url,
        state_path = %config.state_path.display(),
        attempt_interval_ms = config.attempt_interval.as_millis() as u64,
        "Starting tether node agent"
    );

    // A corrupt state file is fatal; a missing one starts empty.
    let achiever = SuperController::new(
        default_factories(),
        AchieverConfig {
            state_path: config.state_path.clone(),
        },
    )
    .await?;
    info!(attributes = achiever.actual().len(), "Actual state loaded");

    let client = Arc::new(HttpControlPlaneClient::new(&config)?);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Received shutdown signal");
            cancel.cancel();
        }
    });

    let agent = Agent::new(
        config,
        client,
        Arc::new(ProcessMetricsCollector::new()),
        Arc::new(LogMetricsReporter),
        achiever,
    );
    agent.run(cancel).await?;

    info!("Node agent shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
