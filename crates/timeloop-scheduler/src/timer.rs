//! Process-owned timers driving the sweeper and the redelivery worker.
//! Uses `tokio::time::interval`, so nothing runs between ticks.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::report::SweepReport;
use crate::retry::{RedeliveryReport, Redeliverer};
use crate::sweeper::{SweepError, Sweeper};

/// Runs one sweep per interval until cancelled. The first sweep runs
/// immediately.
pub struct SweepTimer {
    sweeper: Arc<Sweeper>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl SweepTimer {
    pub fn new(sweeper: Arc<Sweeper>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            sweeper,
            clock,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// One sweep at the clock's current time. Errors are logged; the next
    /// tick retries.
    pub async fn tick(&self, cancel: &CancellationToken) -> Option<SweepReport> {
        let now = self.clock.now();
        match self.sweeper.sweep(now, cancel).await {
            Ok(report) => Some(report),
            Err(SweepError::StoreUnavailable { source, partial }) => {
                tracing::error!(
                    "❌ Sweep aborted ({source}); {} capsules unlocked before the failure",
                    partial.transitions()
                );
                None
            }
        }
    }

    /// Loop until `cancel` fires. Returns the number of sweeps started.
    pub async fn run(self, cancel: CancellationToken) -> u64 {
        tracing::info!(
            "⏰ Unlock sweeper {} started (every {}s)",
            self.sweeper.instance_id(),
            self.interval.as_secs()
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    ticks += 1;
                    self.tick(&cancel).await;
                }
            }
        }

        tracing::info!("⏹️ Unlock sweeper stopped after {ticks} sweeps");
        ticks
    }
}

/// Drains the retry queue on its own interval.
pub struct RedeliveryTimer {
    worker: Arc<Redeliverer>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl RedeliveryTimer {
    pub fn new(worker: Arc<Redeliverer>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            worker,
            clock,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub async fn tick(&self) -> Option<RedeliveryReport> {
        match self.worker.run_once(self.clock.now()).await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!("⚠️ Redelivery pass failed: {e}");
                None
            }
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> u64 {
        tracing::info!("📨 Redelivery worker started (every {}s)", self.interval.as_secs());
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    ticks += 1;
                    self.tick().await;
                }
            }
        }
        ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capsule::{CapsuleState, EventKind, NewCapsule, NotificationPayload, UserId, Visibility};
    use crate::clock::ManualClock;
    use crate::dispatch::{DeliveryResult, Dispatcher};
    use crate::retry::{MemoryRetryQueue, NewRetry, RetryPolicy, RetryQueue, RetryStatus};
    use crate::store::{CapsuleStore, MemoryCapsuleStore};
    use crate::sweeper::SweepSettings;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl Dispatcher for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        async fn dispatch(&self, _: UserId, _: EventKind, _: &NotificationPayload) -> DeliveryResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            DeliveryResult::Delivered
        }
    }

    fn sweeper(store: Arc<MemoryCapsuleStore>, dispatcher: Arc<Counting>) -> Arc<Sweeper> {
        Arc::new(Sweeper::new(
            store,
            dispatcher,
            Arc::new(MemoryRetryQueue::new()),
            SweepSettings::default(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ticks_per_interval_until_cancelled() {
        let store = Arc::new(MemoryCapsuleStore::new());
        let start = Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let timer = SweepTimer::new(
            sweeper(store, Arc::new(Counting::default())),
            clock,
            Duration::from_secs(3600),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(timer.run(cancel.clone()));
        // Ticks at 0h, 1h and 2h.
        tokio::time::sleep(Duration::from_secs(9000)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_tick_uses_injected_clock() {
        let store = Arc::new(MemoryCapsuleStore::new());
        let start = Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap();
        let capsule = store
            .insert(
                &NewCapsule {
                    owner: 1,
                    title: "one year later".into(),
                    content: None,
                    media_url: None,
                    media_type: None,
                    unlock_at: start + chrono::Duration::days(365),
                    visibility: Visibility::Public,
                },
                start,
            )
            .unwrap();
        let dispatcher = Arc::new(Counting::default());
        let clock = Arc::new(ManualClock::new(start));
        let timer = SweepTimer::new(
            sweeper(store.clone(), dispatcher.clone()),
            clock.clone(),
            Duration::from_secs(60),
        );
        let cancel = CancellationToken::new();

        assert_eq!(timer.tick(&cancel).await.unwrap().unlocked, 0);
        clock.advance(chrono::Duration::days(365));
        assert_eq!(timer.tick(&cancel).await.unwrap().unlocked, 1);
        assert_eq!(store.get(capsule.id).unwrap().unwrap().state, CapsuleState::Unlocked);
        assert_eq!(dispatcher.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_timer_drains_queue() {
        let start = Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap();
        let queue = Arc::new(MemoryRetryQueue::new());
        let id = queue
            .enqueue(
                &NewRetry {
                    user_id: 1,
                    kind: EventKind::CapsuleUnlocked,
                    payload: NotificationPayload { capsule_id: 1, title: "t".into() },
                    attempts: 1,
                    error: "timed out".into(),
                    next_attempt_at: start,
                },
                start,
            )
            .unwrap();
        let worker = Arc::new(Redeliverer::new(
            queue.clone(),
            Arc::new(Counting::default()),
            RetryPolicy::default(),
            10,
            Duration::from_secs(5),
        ));
        let timer = RedeliveryTimer::new(worker, Arc::new(ManualClock::new(start)), Duration::from_secs(60));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(timer.run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(90)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), 2);
        assert_eq!(queue.record(id).unwrap().unwrap().status, RetryStatus::Delivered);
    }
}
