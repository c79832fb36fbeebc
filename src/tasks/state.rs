//! Task state machine.
//!
//! ```text
//! Queued ──► Processing ──► Completed
//!   │            │  └─────► Failed ──► Queued   (retry, while retry_count < max_retries)
//!   │            ├────────► Queued              (lease reclaimed from a dead worker)
//!   └────────────┴────────► Canceled
//! ```
//!
//! The record store enforces these rules with conditional updates; this module
//! is the single place that states them.

use super::model::TaskStatus;

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Queued, Processing) | (Queued, Canceled) |
            (Processing, Completed) | (Processing, Failed) |
            (Processing, Canceled) | (Processing, Queued) |
            (Failed, Queued)
        )
    }

    /// Cancel is only legal before a terminal outcome.
    pub fn is_cancelable(&self) -> bool {
        self.can_transition_to(TaskStatus::Canceled)
    }
}
