//! Configuration for the node agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tether_state::{clamp_attempt_interval, DEFAULT_ATTEMPT_INTERVAL, DEFAULT_STATE_FILE};

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identity of this node towards the control plane.
    pub node_id: String,

    /// Control plane API URL.
    pub control_plane_url: String,

    /// Persisted actual-state document.
    pub state_path: PathBuf,

    /// Interval between reconciliation attempts when no new desired state
    /// arrives. Always within the accepted range.
    pub attempt_interval: Duration,

    /// Interval between metrics collections.
    pub metrics_interval: Duration,

    /// How long the control plane may hold a desired-state fetch open.
    pub long_poll: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_id: "node-local".to_string(),
            control_plane_url: "http://127.0.0.1:8080".to_string(),
            state_path: PathBuf::from(DEFAULT_STATE_FILE),
            attempt_interval: DEFAULT_ATTEMPT_INTERVAL,
            metrics_interval: Duration::from_secs(60),
            long_poll: Duration::from_secs(30),
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let node_id = lookup("TETHER_NODE_ID")
            .or_else(|| lookup("HOSTNAME"))
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.node_id);

        let control_plane_url =
            lookup("TETHER_CONTROL_PLANE_URL").unwrap_or(defaults.control_plane_url);
        reqwest::Url::parse(&control_plane_url)
            .with_context(|| format!("invalid TETHER_CONTROL_PLANE_URL {control_plane_url:?}"))?;

        let state_path = lookup("TETHER_STATE_PATH")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.state_path);

        // Unparsable values count as unset.
        let attempt_interval = clamp_attempt_interval(Duration::from_millis(
            lookup("TETHER_ATTEMPT_INTERVAL_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        ));

        let metrics_interval = lookup("TETHER_METRICS_INTERVAL_SECS")
            .and_then(|s| s.parse().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.metrics_interval);

        let long_poll = lookup("TETHER_LONG_POLL_SECS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.long_poll);

        let log_level = lookup("TETHER_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            node_id,
            control_plane_url,
            state_path,
            attempt_interval,
            metrics_interval,
            long_poll,
            log_level,
        })
    }
}
