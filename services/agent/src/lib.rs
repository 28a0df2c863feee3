//! Tether Node Agent Library
//!
//! The node agent runs on each managed host and keeps a set of named
//! attributes (stack versions, the agent binary itself, shell-configured
//! settings) converged toward the desired state published by the control
//! plane.
//!
//! ## Architecture
//!
//! Five independent cycles share one cancellation token:
//!
//! ```text
//! Agent
//! ├── fetch            (control plane → desired-state queue)
//! ├── reconcile        (desired state → SuperController → actual-state queue)
//! ├── report           (actual-state queue → control plane)
//! ├── metrics collect  (collector → buffered channel)
//! └── metrics report   (buffered channel → reporter)
//! ```
//!
//! ## Modules
//!
//! - `agent`: Task wiring and supervision
//! - `client`: Control plane HTTP client
//! - `workers`: Microcontrollers for the built-in attribute kinds

pub mod agent;
pub mod client;
pub mod config;
pub mod fetch;
pub mod metrics;
pub mod reconciler;
pub mod report;
pub mod workers;

// Re-export commonly used types
pub use agent::Agent;
pub use client::{ControlPlane, HttpControlPlaneClient};
pub use config::AgentConfig;
pub use metrics::{LogMetricsReporter, Metrics, MetricsCollector, MetricsReporter, ProcessMetricsCollector};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use workers::default_factories;
