//! Delivery retry queue and the redelivery worker.
//!
//! A failed unlock notification is stored here instead of re-running the
//! unlock. The worker retries with exponential backoff until the dispatcher
//! delivers, reports no endpoint, or the attempt budget runs out.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use timeloop_core::config::DeliveryConfig;

use crate::capsule::{CapsuleId, EventKind, NotificationPayload, UserId};
use crate::dispatch::{DeliveryResult, Dispatcher};
use crate::persistence::{TimeLoopDb, from_millis, to_millis};
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Pending,
    Delivered,
    /// Redelivery found no reachable endpoint.
    Dropped,
    /// Gave up after `max_attempts`.
    Dead,
}

impl RetryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStatus::Pending => "pending",
            RetryStatus::Delivered => "delivered",
            RetryStatus::Dropped => "dropped",
            RetryStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RetryStatus::Pending),
            "delivered" => Some(RetryStatus::Delivered),
            "dropped" => Some(RetryStatus::Dropped),
            "dead" => Some(RetryStatus::Dead),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub id: i64,
    pub capsule_id: CapsuleId,
    pub user_id: UserId,
    pub kind: String,
    pub payload: serde_json::Value,
    /// Delivery attempts made so far, including the one made by the sweep.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub status: RetryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRetry {
    pub user_id: UserId,
    pub kind: EventKind,
    pub payload: NotificationPayload,
    pub attempts: u32,
    pub error: String,
    pub next_attempt_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryUpdate {
    Delivered,
    Dropped,
    Reschedule {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    Dead {
        attempts: u32,
        error: String,
    },
}

pub trait RetryQueue: Send + Sync {
    fn enqueue(&self, retry: &NewRetry, now: DateTime<Utc>) -> Result<i64, StoreError>;

    /// Pending records with `next_attempt_at <= now`, oldest first.
    fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RetryRecord>, StoreError>;

    fn update(&self, id: i64, update: RetryUpdate, now: DateTime<Utc>) -> Result<(), StoreError>;

    fn record(&self, id: i64) -> Result<Option<RetryRecord>, StoreError>;

    fn pending_count(&self) -> Result<usize, StoreError>;
}

fn apply(record: &mut RetryRecord, update: RetryUpdate, now: DateTime<Utc>) {
    record.updated_at = now;
    match update {
        RetryUpdate::Delivered => record.status = RetryStatus::Delivered,
        RetryUpdate::Dropped => record.status = RetryStatus::Dropped,
        RetryUpdate::Reschedule { attempts, next_attempt_at, error } => {
            record.attempts = attempts;
            record.next_attempt_at = next_attempt_at;
            record.last_error = Some(error);
        }
        RetryUpdate::Dead { attempts, error } => {
            record.status = RetryStatus::Dead;
            record.attempts = attempts;
            record.last_error = Some(error);
        }
    }
}

// ─── In-memory queue ──────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryRetryQueue {
    records: Mutex<Vec<RetryRecord>>,
}

impl MemoryRetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<RetryRecord>>, StoreError> {
        self.records
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {e}")))
    }

    /// Snapshot of every record, in insertion order.
    pub fn all(&self) -> Vec<RetryRecord> {
        self.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl RetryQueue for MemoryRetryQueue {
    fn enqueue(&self, retry: &NewRetry, now: DateTime<Utc>) -> Result<i64, StoreError> {
        let mut records = self.lock()?;
        let id = records.len() as i64 + 1;
        records.push(RetryRecord {
            id,
            capsule_id: retry.payload.capsule_id,
            user_id: retry.user_id,
            kind: retry.kind.as_str().to_string(),
            payload: serde_json::to_value(&retry.payload).unwrap_or_default(),
            attempts: retry.attempts,
            last_error: Some(retry.error.clone()),
            next_attempt_at: retry.next_attempt_at,
            status: RetryStatus::Pending,
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RetryRecord>, StoreError> {
        let records = self.lock()?;
        let mut due: Vec<RetryRecord> = records
            .iter()
            .filter(|r| r.status == RetryStatus::Pending && r.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|r| (r.next_attempt_at, r.id));
        due.truncate(limit);
        Ok(due)
    }

    fn update(&self, id: i64, update: RetryUpdate, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut records = self.lock()?;
        let record = records.iter_mut().find(|r| r.id == id).ok_or(StoreError::NotFound)?;
        apply(record, update, now);
        Ok(())
    }

    fn record(&self, id: i64) -> Result<Option<RetryRecord>, StoreError> {
        Ok(self.lock()?.iter().find(|r| r.id == id).cloned())
    }

    fn pending_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.iter().filter(|r| r.status == RetryStatus::Pending).count())
    }
}

// ─── SQLite queue ─────────────────────────────────────────

const RETRY_COLUMNS: &str = "id, capsule_id, user_id, kind, payload, attempts, last_error, \
     next_attempt_at, status, created_at, updated_at";

fn row_to_retry(row: &rusqlite::Row<'_>) -> rusqlite::Result<RetryRecord> {
    let payload: String = row.get(4)?;
    let next_attempt_at: i64 = row.get(7)?;
    let status: String = row.get(8)?;
    let created_at: i64 = row.get(9)?;
    let updated_at: i64 = row.get(10)?;
    Ok(RetryRecord {
        id: row.get(0)?,
        capsule_id: row.get(1)?,
        user_id: row.get(2)?,
        kind: row.get(3)?,
        payload: serde_json::from_str(&payload).unwrap_or_default(),
        attempts: row.get(5)?,
        last_error: row.get(6)?,
        next_attempt_at: from_millis(next_attempt_at).unwrap_or_default(),
        status: RetryStatus::parse(&status).unwrap_or(RetryStatus::Dead),
        created_at: from_millis(created_at).unwrap_or_default(),
        updated_at: from_millis(updated_at).unwrap_or_default(),
    })
}

impl RetryQueue for TimeLoopDb {
    fn enqueue(&self, retry: &NewRetry, now: DateTime<Utc>) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(&retry.payload)
            .map_err(|e| StoreError::Unavailable(format!("payload encode failed: {e}")))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO delivery_retries
             (capsule_id, user_id, kind, payload, attempts, last_error, next_attempt_at, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?8)",
            params![
                retry.payload.capsule_id,
                retry.user_id,
                retry.kind.as_str(),
                payload,
                retry.attempts,
                retry.error,
                to_millis(retry.next_attempt_at),
                to_millis(now),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RetryRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RETRY_COLUMNS} FROM delivery_retries
             WHERE status = 'pending' AND next_attempt_at <= ?1
             ORDER BY next_attempt_at ASC, id ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![to_millis(now), limit as i64], row_to_retry)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn update(&self, id: i64, update: RetryUpdate, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut record = self.record(id)?.ok_or(StoreError::NotFound)?;
        apply(&mut record, update, now);
        let conn = self.conn()?;
        conn.execute(
            "UPDATE delivery_retries
             SET attempts = ?2, last_error = ?3, next_attempt_at = ?4, status = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                id,
                record.attempts,
                record.last_error,
                to_millis(record.next_attempt_at),
                record.status.as_str(),
                to_millis(now),
            ],
        )?;
        Ok(())
    }

    fn record(&self, id: i64) -> Result<Option<RetryRecord>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {RETRY_COLUMNS} FROM delivery_retries WHERE id = ?1"),
                [id],
                row_to_retry,
            )
            .optional()?)
    }

    fn pending_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM delivery_retries WHERE status = 'pending'",
            [],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }
}

// ─── Backoff ──────────────────────────────────────────────

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_secs(config.base_backoff_secs),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
        }
    }

    /// Wait after the `attempt`-th failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }

    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempt)).unwrap_or_default();
        now.checked_add_signed(delay).unwrap_or(now)
    }
}

// ─── Redelivery worker ────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RedeliveryReport {
    pub attempted: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub rescheduled: usize,
    pub dead: usize,
}

/// Drains due retry records through the dispatcher.
pub struct Redeliverer {
    queue: Arc<dyn RetryQueue>,
    dispatcher: Arc<dyn Dispatcher>,
    policy: RetryPolicy,
    batch_size: usize,
    dispatch_timeout: Duration,
}

impl Redeliverer {
    pub fn new(
        queue: Arc<dyn RetryQueue>,
        dispatcher: Arc<dyn Dispatcher>,
        policy: RetryPolicy,
        batch_size: usize,
        dispatch_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            policy,
            batch_size: batch_size.max(1),
            dispatch_timeout,
        }
    }

    /// One pass over the due records.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RedeliveryReport, StoreError> {
        let due = self.queue.due(now, self.batch_size)?;
        let mut report = RedeliveryReport::default();

        for record in due {
            report.attempted += 1;
            let update = self.attempt(&record, now).await;
            match &update {
                RetryUpdate::Delivered => {
                    tracing::info!("📬 Redelivered capsule {} to user {}", record.capsule_id, record.user_id);
                    report.delivered += 1;
                }
                RetryUpdate::Dropped => {
                    tracing::info!(
                        "📭 No endpoint for user {}, dropping retry {}",
                        record.user_id,
                        record.id
                    );
                    report.dropped += 1;
                }
                RetryUpdate::Reschedule { attempts, next_attempt_at, error } => {
                    tracing::warn!(
                        "🔁 Retry {} failed (attempt {attempts}): {error}, next at {next_attempt_at}",
                        record.id
                    );
                    report.rescheduled += 1;
                }
                RetryUpdate::Dead { attempts, error } => {
                    tracing::error!(
                        "💀 Giving up on retry {} after {attempts} attempts: {error}",
                        record.id
                    );
                    report.dead += 1;
                }
            }
            self.queue.update(record.id, update, now)?;
        }

        if report.attempted > 0 {
            tracing::info!(
                "📨 Redelivery pass: {} attempted, {} delivered, {} rescheduled, {} dead",
                report.attempted,
                report.delivered,
                report.rescheduled,
                report.dead
            );
        }
        Ok(report)
    }

    async fn attempt(&self, record: &RetryRecord, now: DateTime<Utc>) -> RetryUpdate {
        // The sweep's own attempt already counts against the budget.
        if record.attempts >= self.policy.max_attempts {
            return RetryUpdate::Dead {
                attempts: record.attempts,
                error: record
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "attempt budget exhausted".into()),
            };
        }
        let attempts = record.attempts.saturating_add(1);

        let decoded = EventKind::parse(&record.kind).zip(
            serde_json::from_value::<NotificationPayload>(record.payload.clone()).ok(),
        );
        let Some((kind, payload)) = decoded else {
            return RetryUpdate::Dead {
                attempts: record.attempts,
                error: format!("unreadable retry record (kind '{}')", record.kind),
            };
        };

        let result = tokio::time::timeout(
            self.dispatch_timeout,
            self.dispatcher.dispatch(record.user_id, kind, &payload),
        )
        .await
        .unwrap_or_else(|_| {
            DeliveryResult::Failed(format!("timed out after {:?}", self.dispatch_timeout))
        });

        match result {
            DeliveryResult::Delivered => RetryUpdate::Delivered,
            DeliveryResult::Deferred => RetryUpdate::Dropped,
            DeliveryResult::Failed(error) if attempts >= self.policy.max_attempts => {
                RetryUpdate::Dead { attempts, error }
            }
            DeliveryResult::Failed(error) => RetryUpdate::Reschedule {
                attempts,
                next_attempt_at: self.policy.next_attempt_at(now, attempts),
                error,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 14, 9, 0, 0).unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(100),
        }
    }

    fn new_retry(capsule_id: CapsuleId, next_attempt_at: DateTime<Utc>) -> NewRetry {
        NewRetry {
            user_id: 5,
            kind: EventKind::CapsuleUnlocked,
            payload: NotificationPayload { capsule_id, title: "Summer 2026".into() },
            attempts: 1,
            error: "timed out".into(),
            next_attempt_at,
        }
    }

    /// Replays a scripted sequence of outcomes.
    struct Scripted {
        outcomes: Mutex<Vec<DeliveryResult>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut outcomes: Vec<DeliveryResult>) -> Arc<Self> {
            outcomes.reverse();
            Arc::new(Self { outcomes: Mutex::new(outcomes), calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl Dispatcher for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn dispatch(&self, _: UserId, _: EventKind, _: &NotificationPayload) -> DeliveryResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes.lock().unwrap().pop().unwrap_or(DeliveryResult::Delivered)
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay(1), Duration::from_secs(30));
        assert_eq!(p.delay(2), Duration::from_secs(60));
        assert_eq!(p.delay(3), Duration::from_secs(100));
        assert_eq!(p.delay(200), Duration::from_secs(100));
        assert_eq!(p.next_attempt_at(t0(), 2), t0() + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_sqlite_queue_due_and_update() {
        let db = TimeLoopDb::open_in_memory().unwrap();
        let later = db.enqueue(&new_retry(2, t0() + chrono::Duration::minutes(5)), t0()).unwrap();
        let now = db.enqueue(&new_retry(1, t0()), t0()).unwrap();
        assert_eq!(db.pending_count().unwrap(), 2);

        let due = db.due(t0(), 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, now);
        assert_eq!(due[0].kind, "capsule_unlocked");
        assert_eq!(due[0].payload["capsuleId"], 1);
        assert_eq!(due[0].attempts, 1);

        db.update(now, RetryUpdate::Delivered, t0()).unwrap();
        db.update(
            later,
            RetryUpdate::Dead { attempts: 3, error: "gone".into() },
            t0(),
        )
        .unwrap();
        assert_eq!(db.pending_count().unwrap(), 0);
        let dead = db.record(later).unwrap().unwrap();
        assert_eq!(dead.status, RetryStatus::Dead);
        assert_eq!(dead.last_error.as_deref(), Some("gone"));
        assert!(matches!(db.update(99, RetryUpdate::Dropped, t0()), Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_redelivery_until_delivered() {
        let queue = Arc::new(MemoryRetryQueue::new());
        let id = queue.enqueue(&new_retry(1, t0()), t0()).unwrap();
        let dispatcher = Scripted::new(vec![
            DeliveryResult::Failed("503".into()),
            DeliveryResult::Delivered,
        ]);
        let worker = Redeliverer::new(queue.clone(), dispatcher.clone(), policy(), 10, Duration::from_secs(1));

        let first = worker.run_once(t0()).await.unwrap();
        assert_eq!(first.rescheduled, 1);
        let record = queue.record(id).unwrap().unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.next_attempt_at, t0() + chrono::Duration::seconds(60));

        // Not due yet.
        assert_eq!(worker.run_once(t0()).await.unwrap().attempted, 0);

        let second = worker.run_once(record.next_attempt_at).await.unwrap();
        assert_eq!(second.delivered, 1);
        assert_eq!(queue.record(id).unwrap().unwrap().status, RetryStatus::Delivered);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_redelivery_gives_up_after_max_attempts() {
        let queue = Arc::new(MemoryRetryQueue::new());
        let id = queue.enqueue(&new_retry(1, t0()), t0()).unwrap();
        let dispatcher = Scripted::new(vec![
            DeliveryResult::Failed("a".into()),
            DeliveryResult::Failed("b".into()),
        ]);
        let worker = Redeliverer::new(queue.clone(), dispatcher, policy(), 10, Duration::from_secs(1));

        let far = t0() + chrono::Duration::days(1);
        worker.run_once(far).await.unwrap();
        let report = worker.run_once(far + chrono::Duration::days(1)).await.unwrap();
        assert_eq!(report.dead, 1);

        let record = queue.record(id).unwrap().unwrap();
        assert_eq!(record.status, RetryStatus::Dead);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.last_error.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_single_attempt_budget_never_redelivers() {
        let queue = Arc::new(MemoryRetryQueue::new());
        let id = queue.enqueue(&new_retry(1, t0()), t0()).unwrap();
        let dispatcher = Scripted::new(vec![DeliveryResult::Failed("still down".into())]);
        let worker = Redeliverer::new(
            queue.clone(),
            dispatcher.clone(),
            RetryPolicy { max_attempts: 1, ..policy() },
            10,
            Duration::from_secs(1),
        );

        let report = worker.run_once(t0()).await.unwrap();
        assert_eq!(report.dead, 1);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);

        let record = queue.record(id).unwrap().unwrap();
        assert_eq!(record.status, RetryStatus::Dead);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.last_error.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn test_deferred_on_redelivery_is_dropped() {
        let queue = Arc::new(MemoryRetryQueue::new());
        let id = queue.enqueue(&new_retry(1, t0()), t0()).unwrap();
        let worker = Redeliverer::new(
            queue.clone(),
            Scripted::new(vec![DeliveryResult::Deferred]),
            policy(),
            10,
            Duration::from_secs(1),
        );
        assert_eq!(worker.run_once(t0()).await.unwrap().dropped, 1);
        assert_eq!(queue.record(id).unwrap().unwrap().status, RetryStatus::Dropped);
        assert_eq!(queue.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_record_is_dead() {
        let db = Arc::new(TimeLoopDb::open_in_memory().unwrap());
        let id = db.enqueue(&new_retry(1, t0()), t0()).unwrap();
        db.conn()
            .unwrap()
            .execute("UPDATE delivery_retries SET kind = 'mystery' WHERE id = ?1", [id])
            .unwrap();

        let dispatcher = Scripted::new(vec![]);
        let worker = Redeliverer::new(db.clone(), dispatcher.clone(), policy(), 10, Duration::from_secs(1));
        assert_eq!(worker.run_once(t0()).await.unwrap().dead, 1);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }
}
