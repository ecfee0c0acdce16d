//! Sweep outcomes: per-capsule events for observers and the per-sweep summary.

use serde::Serialize;

use crate::capsule::{CapsuleId, UserId};

/// Everything notable that happens during a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SweepEvent {
    Unlocked { capsule: CapsuleId, owner: UserId },
    /// Another sweeper claimed the capsule first. Expected under concurrency.
    ClaimConflict { capsule: CapsuleId },
    /// Claimed, but the commit found the capsule no longer Unlocking.
    CommitSkipped { capsule: CapsuleId },
    /// A claim older than the lease was committed by this sweeper.
    Recovered { capsule: CapsuleId, claimed_by: Option<String> },
    Malformed { capsule: CapsuleId, reason: String },
    Delivered { capsule: CapsuleId, owner: UserId },
    Deferred { capsule: CapsuleId, owner: UserId },
    DispatchFailed {
        capsule: CapsuleId,
        owner: UserId,
        reason: String,
        timed_out: bool,
    },
    RetryQueued { capsule: CapsuleId, retry_id: i64 },
    RetryQueueFailed { capsule: CapsuleId, error: String },
    StoreUnavailable { error: String },
    Cancelled,
}

pub trait SweepObserver: Send + Sync {
    fn on_event(&self, event: &SweepEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl SweepObserver for TracingObserver {
    fn on_event(&self, event: &SweepEvent) {
        match event {
            SweepEvent::Unlocked { capsule, owner } => {
                tracing::info!("🔓 Capsule {capsule} unlocked for user {owner}");
            }
            SweepEvent::ClaimConflict { capsule } => {
                tracing::debug!("🤝 Capsule {capsule} already claimed by another sweeper");
            }
            SweepEvent::CommitSkipped { capsule } => {
                tracing::debug!("⏭️ Capsule {capsule} committed elsewhere, not dispatching");
            }
            SweepEvent::Recovered { capsule, claimed_by } => {
                tracing::warn!(
                    "♻️ Recovered stale claim on capsule {capsule} (held by {})",
                    claimed_by.as_deref().unwrap_or("unknown")
                );
            }
            SweepEvent::Malformed { capsule, reason } => {
                tracing::warn!("🚩 Capsule {capsule} flagged for review: {reason}");
            }
            SweepEvent::Delivered { capsule, owner } => {
                tracing::debug!("📬 Unlock notice for capsule {capsule} delivered to user {owner}");
            }
            SweepEvent::Deferred { capsule, owner } => {
                tracing::debug!("📭 User {owner} has no reachable endpoint for capsule {capsule}");
            }
            SweepEvent::DispatchFailed { capsule, owner, reason, timed_out } => {
                let what = if *timed_out { "timed out" } else { "failed" };
                tracing::warn!("⚠️ Dispatch {what} for capsule {capsule} (user {owner}): {reason}");
            }
            SweepEvent::RetryQueued { capsule, retry_id } => {
                tracing::info!("🔁 Capsule {capsule} notification queued for retry #{retry_id}");
            }
            SweepEvent::RetryQueueFailed { capsule, error } => {
                tracing::error!("❌ Could not queue retry for capsule {capsule}: {error}");
            }
            SweepEvent::StoreUnavailable { error } => {
                tracing::error!("🛑 Store unavailable, sweep aborted: {error}");
            }
            SweepEvent::Cancelled => {
                tracing::info!("⏹️ Sweep cancelled");
            }
        }
    }
}

/// Collects events in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingObserver {
    pub events: std::sync::Mutex<Vec<SweepEvent>>,
}

#[cfg(test)]
impl RecordingObserver {
    pub fn events(&self) -> Vec<SweepEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl SweepObserver for RecordingObserver {
    fn on_event(&self, event: &SweepEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Summary of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub pages: usize,
    pub scanned: usize,
    pub claimed: usize,
    pub conflicts: usize,
    pub recovered: usize,
    pub unlocked: usize,
    pub flagged: usize,
    pub delivered: usize,
    pub deferred: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub retries_queued: usize,
    pub cancelled: bool,
}

impl SweepReport {
    /// Capsules that reached Unlocked in this sweep, fresh or recovered.
    pub fn transitions(&self) -> usize {
        self.unlocked + self.recovered
    }

    pub fn dispatches(&self) -> usize {
        self.delivered + self.deferred + self.failed
    }
}
