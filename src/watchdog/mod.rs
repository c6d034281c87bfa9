//! Periodic watchdog for one VO and production source label.
//!
//! A pass runs every action in a fixed order. Per-task failures are logged
//! and counted in the pass report; they never abort the pass.

mod engine;
mod reassign;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::store::{BulkOutcome, ReactivateOutcome};

pub use engine::WatchDog;
pub use reassign::Reassigned;

/// Counts for one watchdog action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionSummary {
    /// Tasks considered.
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Tasks considered but left alone.
    pub skipped: usize,
}

impl ActionSummary {
    /// The action could not run at all.
    pub fn call_failed() -> Self {
        Self {
            failed: 1,
            ..Self::default()
        }
    }

    pub fn merge(&mut self, other: ActionSummary) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

impl From<BulkOutcome> for ActionSummary {
    fn from(outcome: BulkOutcome) -> Self {
        Self {
            processed: outcome.matched,
            succeeded: outcome.updated,
            failed: outcome.failed,
            skipped: 0,
        }
    }
}

impl From<ReactivateOutcome> for ActionSummary {
    fn from(outcome: ReactivateOutcome) -> Self {
        let mut summary = ActionSummary::from(outcome.released);
        summary.merge(outcome.timed_out.into());
        summary
    }
}

/// Result of one watchdog pass.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogReport {
    pub pass_id: Uuid,
    pub stale_locks: ActionSummary,
    pub priority_boost: ActionSummary,
    pub reassign: ActionSummary,
    pub throttle_release: ActionSummary,
    pub throttle: ActionSummary,
    /// One entry per `(min priority, idle time)` rule, keyed by min priority.
    pub pending_reactivation: Vec<(i64, ActionSummary)>,
    pub scout_data: ActionSummary,
}

impl WatchdogReport {
    fn new(pass_id: Uuid) -> Self {
        Self {
            pass_id,
            stale_locks: ActionSummary::default(),
            priority_boost: ActionSummary::default(),
            reassign: ActionSummary::default(),
            throttle_release: ActionSummary::default(),
            throttle: ActionSummary::default(),
            pending_reactivation: Vec::new(),
            scout_data: ActionSummary::default(),
        }
    }

    /// Failures across every action of the pass.
    pub fn total_failed(&self) -> usize {
        [
            self.stale_locks,
            self.priority_boost,
            self.reassign,
            self.throttle_release,
            self.throttle,
            self.scout_data,
        ]
        .iter()
        .chain(self.pending_reactivation.iter().map(|(_, s)| s))
        .map(|s| s.failed)
        .sum()
    }
}

/// Spawn a background task running a watchdog pass every `interval`.
pub fn spawn_watchdog_ticker(
    watchdog: Arc<WatchDog>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            watchdog.do_action().await;
        }
    })
}
