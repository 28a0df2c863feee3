//! Control plane API client for the node agent.
//!
//! Provides methods for communicating with the control plane:
//! - Fetching the desired state of this node's attributes
//! - Reporting the actual state back
//!
//! Cancellation works by dropping the returned future, so callers race
//! these calls against their cancellation token.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tether_state::{ActualState, DesiredState};
use tracing::{debug, error};

use crate::config::AgentConfig;

/// Request timeout on top of the long-poll wait.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The control plane as seen by the agent's cycles.
///
/// Every returned or accepted snapshot is an owned value, safe to hand
/// across tasks.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch the current desired state for this node.
    async fn get_desired_state(&self) -> Result<DesiredState>;

    /// Report the actual state of this node.
    async fn report_actual_state(&self, actual: &ActualState) -> Result<()>;
}

/// HTTP implementation of [`ControlPlane`].
pub struct HttpControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    node_id: String,
    long_poll: Duration,
}

impl HttpControlPlaneClient {
    /// Create a new control plane client.
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.long_poll + REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.control_plane_url.trim_end_matches('/').to_string(),
            node_id: config.node_id.clone(),
            long_poll: config.long_poll,
        })
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlaneClient {
    async fn get_desired_state(&self) -> Result<DesiredState> {
        let url = format!(
            "{}/v1/nodes/{}/desired-state?wait_secs={}",
            self.base_url,
            self.node_id,
            self.long_poll.as_secs()
        );
        debug!(url = %url, "Fetching desired state");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to fetch desired state");
            anyhow::bail!("Failed to fetch desired state: {} - {}", status, body);
        }

        let desired: DesiredState = response
            .json()
            .await
            .context("failed to decode desired state")?;
        debug!(attributes = desired.len(), "Fetched desired state");

        Ok(desired)
    }

    async fn report_actual_state(&self, actual: &ActualState) -> Result<()> {
        let url = format!("{}/v1/nodes/{}/actual-state", self.base_url, self.node_id);
        debug!(attributes = actual.len(), "Reporting actual state");

        let response = self.client.put(&url).json(actual).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to report actual state");
            anyhow::bail!("Failed to report actual state: {} - {}", status, body);
        }

        Ok(())
    }
}
