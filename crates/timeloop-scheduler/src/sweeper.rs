//! The unlock sweeper: finds due capsules, claims and commits them, then sends
//! exactly one unlock notification per committed capsule.
//!
//! Each sweep runs in three steps:
//! 1. commit claims older than the lease (a sweeper crashed mid-unlock),
//! 2. scan due capsules page by page, flag malformed rows, claim + commit the rest,
//! 3. after every page, dispatch the page's commits through a bounded pool.
//!
//! Only the store's conditional updates coordinate concurrent sweepers.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use timeloop_core::TimeLoopConfig;
use tokio_util::sync::CancellationToken;

use crate::capsule::{DueCapsule, EventKind, NotificationPayload};
use crate::dispatch::{DeliveryResult, Dispatcher};
use crate::report::{SweepEvent, SweepObserver, SweepReport, TracingObserver};
use crate::retry::{NewRetry, RetryPolicy, RetryQueue};
use crate::store::{CapsuleStore, StoreError};

#[derive(Debug, Error)]
pub enum SweepError {
    /// The store failed mid-sweep. Work done before the failure is in `partial`.
    #[error("store unavailable during sweep: {source}")]
    StoreUnavailable {
        source: StoreError,
        partial: Box<SweepReport>,
    },
}

impl SweepError {
    pub fn partial(&self) -> &SweepReport {
        match self {
            SweepError::StoreUnavailable { partial, .. } => partial,
        }
    }
}

/// Tunables for one sweeper.
#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub page_size: usize,
    pub max_pages: usize,
    pub dispatch_timeout: Duration,
    pub max_concurrent_dispatches: usize,
    /// Claims older than this are considered abandoned.
    pub claim_lease: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self::from_config(&TimeLoopConfig::default())
    }
}

impl SweepSettings {
    pub fn from_config(config: &TimeLoopConfig) -> Self {
        Self {
            page_size: config.sweeper.page_size.max(1),
            max_pages: config.sweeper.max_pages.max(1),
            dispatch_timeout: config.sweeper.dispatch_timeout(),
            max_concurrent_dispatches: config.sweeper.max_concurrent_dispatches.max(1),
            claim_lease: config.sweeper.claim_lease(),
            retry_policy: RetryPolicy::from_config(&config.delivery),
        }
    }
}

pub struct Sweeper {
    store: Arc<dyn CapsuleStore>,
    dispatcher: Arc<dyn Dispatcher>,
    retries: Arc<dyn RetryQueue>,
    observer: Arc<dyn SweepObserver>,
    settings: SweepSettings,
    instance_id: String,
}

/// How processing of one page ended.
enum PageEnd {
    Finished,
    Cancelled,
    Failed(StoreError),
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn CapsuleStore>,
        dispatcher: Arc<dyn Dispatcher>,
        retries: Arc<dyn RetryQueue>,
        settings: SweepSettings,
    ) -> Self {
        Self {
            store,
            dispatcher,
            retries,
            observer: Arc::new(TracingObserver),
            settings,
            instance_id: format!("sweeper-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SweepObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Name written into `claimed_by`. Blank keeps the generated id.
    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !id.trim().is_empty() {
            self.instance_id = id;
        }
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn settings(&self) -> &SweepSettings {
        &self.settings
    }

    fn emit(&self, event: SweepEvent) {
        self.observer.on_event(&event);
    }

    /// Run one sweep as of `now`.
    ///
    /// Cancellation is checked between capsules; capsules committed before the
    /// check are still dispatched. A store failure aborts the sweep after
    /// dispatching whatever was already committed.
    pub async fn sweep(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<SweepReport, SweepError> {
        let mut report = SweepReport::default();
        tracing::debug!("🧹 Sweep started by {} at {now}", self.instance_id);

        if let Err(e) = self.recover_stale(now, &mut report).await {
            return Err(self.abort(e, report));
        }

        for _ in 0..self.settings.max_pages {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let rows = match self.store.due_candidates(now, self.settings.page_size) {
                Ok(rows) => rows,
                Err(e) => return Err(self.abort(e, report)),
            };
            if rows.is_empty() {
                break;
            }
            report.pages += 1;
            report.scanned += rows.len();
            let full_page = rows.len() == self.settings.page_size;

            let mut committed = Vec::new();
            let mut end = PageEnd::Finished;
            for row in rows {
                if cancel.is_cancelled() {
                    end = PageEnd::Cancelled;
                    break;
                }
                let id = row.id;
                let due = match row.into_due() {
                    Ok(due) => due,
                    Err(reason) => {
                        match self.store.flag_for_review(id, &reason) {
                            Ok(()) => {
                                report.flagged += 1;
                                self.emit(SweepEvent::Malformed { capsule: id, reason });
                            }
                            // Deleted between scan and flag.
                            Err(StoreError::NotFound) => {}
                            Err(e) => {
                                end = PageEnd::Failed(e);
                                break;
                            }
                        }
                        continue;
                    }
                };

                match self.claim_and_commit(&due, now, &mut report) {
                    Ok(true) => committed.push(due),
                    Ok(false) => {}
                    Err(e) => {
                        end = PageEnd::Failed(e);
                        break;
                    }
                }
            }

            self.dispatch_all(committed, now, &mut report).await;

            match end {
                PageEnd::Failed(e) => return Err(self.abort(e, report)),
                PageEnd::Cancelled => {
                    report.cancelled = true;
                    break;
                }
                PageEnd::Finished if !full_page => break,
                PageEnd::Finished => {}
            }
        }

        if report.cancelled {
            self.emit(SweepEvent::Cancelled);
        }
        if report.transitions() > 0 || report.flagged > 0 {
            tracing::info!(
                "🧹 Sweep done: {} unlocked, {} recovered, {} flagged, {} conflicts, {} retries queued",
                report.unlocked,
                report.recovered,
                report.flagged,
                report.conflicts,
                report.retries_queued
            );
        }
        Ok(report)
    }

    /// Commit claims that outlived the lease and dispatch them once.
    async fn recover_stale(
        &self,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), StoreError> {
        let lease = chrono::Duration::from_std(self.settings.claim_lease).unwrap_or_default();
        let cutoff = now.checked_sub_signed(lease).unwrap_or(now);
        let stale = self.store.stale_claims(cutoff, self.settings.page_size)?;

        let mut committed = Vec::new();
        let mut failure = None;
        for capsule in stale {
            match self.store.commit(capsule.id, now) {
                Ok(true) => {
                    report.recovered += 1;
                    self.emit(SweepEvent::Recovered {
                        capsule: capsule.id,
                        claimed_by: capsule.claimed_by.clone(),
                    });
                    committed.push(DueCapsule::from(&capsule));
                }
                Ok(false) => self.emit(SweepEvent::CommitSkipped { capsule: capsule.id }),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.dispatch_all(committed, now, report).await;
        failure.map_or(Ok(()), Err)
    }

    /// Locked → Unlocking → Unlocked. `Ok(true)` only when this sweeper did
    /// both transitions and therefore owns the dispatch.
    fn claim_and_commit(
        &self,
        due: &DueCapsule,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<bool, StoreError> {
        if !self.store.claim(due.id, &self.instance_id, now)? {
            report.conflicts += 1;
            self.emit(SweepEvent::ClaimConflict { capsule: due.id });
            return Ok(false);
        }
        report.claimed += 1;

        if !self.store.commit(due.id, now)? {
            self.emit(SweepEvent::CommitSkipped { capsule: due.id });
            return Ok(false);
        }
        report.unlocked += 1;
        self.emit(SweepEvent::Unlocked { capsule: due.id, owner: due.owner });
        Ok(true)
    }

    /// Dispatch a batch concurrently, bounded by `max_concurrent_dispatches`.
    /// Failures and timeouts are queued for redelivery.
    async fn dispatch_all(
        &self,
        batch: Vec<DueCapsule>,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        if batch.is_empty() {
            return;
        }
        let timeout = self.settings.dispatch_timeout;
        let dispatcher = &self.dispatcher;

        let outcomes: Vec<(DueCapsule, DeliveryResult, bool)> = futures::stream::iter(batch)
            .map(|capsule| async move {
                let payload = NotificationPayload::from(&capsule);
                let sent = tokio::time::timeout(
                    timeout,
                    dispatcher.dispatch(capsule.owner, EventKind::CapsuleUnlocked, &payload),
                )
                .await;
                match sent {
                    Ok(result) => (capsule, result, false),
                    Err(_) => {
                        let reason = format!("dispatch timed out after {timeout:?}");
                        (capsule, DeliveryResult::Failed(reason), true)
                    }
                }
            })
            .buffer_unordered(self.settings.max_concurrent_dispatches)
            .collect()
            .await;

        for (capsule, result, timed_out) in outcomes {
            match result {
                DeliveryResult::Delivered => {
                    report.delivered += 1;
                    self.emit(SweepEvent::Delivered { capsule: capsule.id, owner: capsule.owner });
                }
                DeliveryResult::Deferred => {
                    report.deferred += 1;
                    self.emit(SweepEvent::Deferred { capsule: capsule.id, owner: capsule.owner });
                }
                DeliveryResult::Failed(reason) => {
                    report.failed += 1;
                    if timed_out {
                        report.timed_out += 1;
                    }
                    self.emit(SweepEvent::DispatchFailed {
                        capsule: capsule.id,
                        owner: capsule.owner,
                        reason: reason.clone(),
                        timed_out,
                    });
                    self.queue_retry(&capsule, reason, now, report);
                }
            }
        }
    }

    fn queue_retry(
        &self,
        capsule: &DueCapsule,
        error: String,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let retry = NewRetry {
            user_id: capsule.owner,
            kind: EventKind::CapsuleUnlocked,
            payload: NotificationPayload::from(capsule),
            attempts: 1,
            error,
            next_attempt_at: self.settings.retry_policy.next_attempt_at(now, 1),
        };
        match self.retries.enqueue(&retry, now) {
            Ok(retry_id) => {
                report.retries_queued += 1;
                self.emit(SweepEvent::RetryQueued { capsule: capsule.id, retry_id });
            }
            Err(e) => self.emit(SweepEvent::RetryQueueFailed {
                capsule: capsule.id,
                error: e.to_string(),
            }),
        }
    }

    fn abort(&self, source: StoreError, report: SweepReport) -> SweepError {
        self.emit(SweepEvent::StoreUnavailable { error: source.to_string() });
        SweepError::StoreUnavailable { source, partial: Box::new(report) }
    }
}
