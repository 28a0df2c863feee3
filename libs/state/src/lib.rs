//! # tether-state
//!
//! The state-achieving engine of the tether node agent.
//!
//! The agent repeatedly compares a *desired* configuration for a set of
//! managed attributes against the *actual*, last-achieved configuration and
//! drives the actual state toward the desired one through pluggable
//! microcontrollers. This crate holds everything that does not touch the
//! network:
//!
//! - `model`: desired/actual attribute types and the convergence predicate
//! - `coalescing`: the capacity-one, last-value-wins queue between stages
//! - `registry`: microcontroller trait, factory table and per-id cache
//! - `achiever`: the reconciliation pass ([`SuperController`])
//! - `store`: whole-document JSON persistence of the actual state
//!
//! # Invariants
//!
//! - Reconciliation is idempotent: an attribute that already achieves its
//!   desired configuration is never touched.
//! - `AttemptNum` restarts at 1 on a new offset and grows by one per retry
//!   of a failed offset.
//! - Snapshots are values; nothing handed to a queue is mutated afterwards.

use std::time::Duration;

pub mod achiever;
pub mod coalescing;
pub mod error;
pub mod model;
pub mod registry;
pub mod store;

pub use achiever::{AchieverConfig, SuperController};
pub use coalescing::{CoalescingReceiver, CoalescingSender};
pub use error::{AchieveErrors, AttributeError, StoreError};
pub use model::{
    ActualAttribute, ActualState, ActualStatus, AttrOffset, AttributeKind, DesiredAttribute,
    DesiredState,
};
pub use registry::{from_fn, Attempt, Factories, Microcontroller, MicrocontrollerFactory, Registry};
pub use store::{StateFile, DEFAULT_STATE_FILE};

/// Default interval between reconciliation attempts without new desired state.
pub const DEFAULT_ATTEMPT_INTERVAL: Duration = Duration::from_secs(5);

/// Shortest accepted attempt interval.
pub const MIN_ATTEMPT_INTERVAL: Duration = Duration::from_millis(10);

/// Longest accepted attempt interval.
pub const MAX_ATTEMPT_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Normalize a configured attempt interval.
///
/// Zero means unset and yields [`DEFAULT_ATTEMPT_INTERVAL`]; anything else is
/// clamped to `[MIN_ATTEMPT_INTERVAL, MAX_ATTEMPT_INTERVAL]`.
pub fn clamp_attempt_interval(interval: Duration) -> Duration {
    if interval.is_zero() {
        DEFAULT_ATTEMPT_INTERVAL
    } else {
        interval.clamp(MIN_ATTEMPT_INTERVAL, MAX_ATTEMPT_INTERVAL)
    }
}
