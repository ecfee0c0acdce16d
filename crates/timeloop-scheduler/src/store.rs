//! Capsule store abstraction and an in-memory implementation.
//!
//! The claim and commit operations are conditional updates: they report whether
//! a row actually changed, and that boolean is the whole concurrency contract.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use thiserror::Error;

use crate::capsule::{
    CandidateRow, Capsule, CapsuleId, CapsuleState, NewCapsule, UserId, ValidationError,
};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend unreachable, locked or failing. Transient.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("not found")]
    NotFound,
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Persistent record of capsules.
pub trait CapsuleStore: Send + Sync {
    /// Insert a validated capsule in the `Locked` state.
    fn insert(&self, new: &NewCapsule, now: DateTime<Utc>) -> Result<Capsule, StoreError>;

    fn get(&self, id: CapsuleId) -> Result<Option<Capsule>, StoreError>;

    /// Capsules owned by `owner`, soonest unlock first. Never mutates.
    fn list_by_owner(&self, owner: UserId) -> Result<Vec<Capsule>, StoreError>;

    /// Locked, unreviewed capsules with `unlock_at <= now`, plus damaged rows
    /// (no owner / no unlock_at) so the caller can flag them. At most `limit`.
    fn due_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CandidateRow>, StoreError>;

    /// Locked → Unlocking. `Ok(false)` when the capsule was not Locked.
    fn claim(
        &self,
        id: CapsuleId,
        claimant: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Unlocking → Unlocked. `Ok(false)` when the capsule was not Unlocking.
    fn commit(&self, id: CapsuleId, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Exclude a capsule from future scans.
    fn flag_for_review(&self, id: CapsuleId, reason: &str) -> Result<(), StoreError>;

    /// Capsules stuck in Unlocking with `claimed_at <= cutoff`.
    fn stale_claims(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Capsule>, StoreError>;
}

// ─── In-memory store ──────────────────────────────────────

#[derive(Debug, Clone)]
struct Row {
    id: CapsuleId,
    owner: Option<UserId>,
    title: String,
    content: Option<String>,
    media_url: Option<String>,
    media_type: Option<String>,
    unlock_at: Option<DateTime<Utc>>,
    visibility: crate::capsule::Visibility,
    state: CapsuleState,
    created_at: DateTime<Utc>,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    unlocked_at: Option<DateTime<Utc>>,
    review_reason: Option<String>,
}

impl Row {
    fn to_capsule(&self) -> Option<Capsule> {
        Some(Capsule {
            id: self.id,
            owner: self.owner?,
            title: self.title.clone(),
            content: self.content.clone(),
            media_url: self.media_url.clone(),
            media_type: self.media_type.clone(),
            unlock_at: self.unlock_at?,
            visibility: self.visibility,
            state: self.state,
            created_at: self.created_at,
            claimed_by: self.claimed_by.clone(),
            claimed_at: self.claimed_at,
            unlocked_at: self.unlocked_at,
            needs_review: self.review_reason.is_some(),
        })
    }

    fn is_candidate(&self, now: DateTime<Utc>) -> bool {
        if self.state != CapsuleState::Locked || self.review_reason.is_some() {
            return false;
        }
        match (self.owner, self.unlock_at) {
            (Some(_), Some(at)) => at <= now,
            _ => true,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    rows: Vec<Row>,
    next_id: CapsuleId,
}

/// Mutex-guarded store for embedding and tests. Every operation holds the lock
/// for its whole duration, so claim/commit are atomic.
#[derive(Debug, Default)]
pub struct MemoryCapsuleStore {
    inner: Mutex<Inner>,
}

impl MemoryCapsuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {e}")))
    }

    /// Seed a raw row, bypassing validation. Used to model damaged imports.
    #[cfg(test)]
    pub(crate) fn insert_raw(
        &self,
        owner: Option<UserId>,
        title: &str,
        unlock_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> CapsuleId {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.rows.push(Row {
            id,
            owner,
            title: title.into(),
            content: None,
            media_url: None,
            media_type: None,
            unlock_at,
            visibility: Default::default(),
            state: CapsuleState::Locked,
            created_at: now,
            claimed_by: None,
            claimed_at: None,
            unlocked_at: None,
            review_reason: None,
        });
        id
    }

    /// Review reason recorded for a flagged capsule.
    pub fn review_reason(&self, id: CapsuleId) -> Option<String> {
        let inner = self.inner.lock().ok()?;
        inner.rows.iter().find(|r| r.id == id)?.review_reason.clone()
    }

    /// Force a capsule into Unlocking as if a sweeper crashed after claiming.
    #[cfg(test)]
    pub(crate) fn force_claimed(&self, id: CapsuleId, claimant: &str, at: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        let row = inner.rows.iter_mut().find(|r| r.id == id).unwrap();
        row.state = CapsuleState::Unlocking;
        row.claimed_by = Some(claimant.into());
        row.claimed_at = Some(at);
    }
}

impl CapsuleStore for MemoryCapsuleStore {
    fn insert(&self, new: &NewCapsule, now: DateTime<Utc>) -> Result<Capsule, StoreError> {
        new.validate()?;
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let row = Row {
            id: inner.next_id,
            owner: Some(new.owner),
            title: new.title.trim().to_string(),
            content: new.content.clone(),
            media_url: new.media_url.clone(),
            media_type: new.media_type.clone(),
            unlock_at: Some(new.unlock_at),
            visibility: new.visibility,
            state: CapsuleState::Locked,
            created_at: now,
            claimed_by: None,
            claimed_at: None,
            unlocked_at: None,
            review_reason: None,
        };
        let capsule = row
            .to_capsule()
            .ok_or_else(|| StoreError::Unavailable("inserted row is incomplete".into()))?;
        inner.rows.push(row);
        Ok(capsule)
    }

    fn get(&self, id: CapsuleId) -> Result<Option<Capsule>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.rows.iter().find(|r| r.id == id).and_then(Row::to_capsule))
    }

    fn list_by_owner(&self, owner: UserId) -> Result<Vec<Capsule>, StoreError> {
        let inner = self.lock()?;
        let mut capsules: Vec<Capsule> = inner
            .rows
            .iter()
            .filter(|r| r.owner == Some(owner))
            .filter_map(Row::to_capsule)
            .collect();
        capsules.sort_by_key(|c| (c.unlock_at, c.id));
        Ok(capsules)
    }

    fn due_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CandidateRow>, StoreError> {
        let inner = self.lock()?;
        let mut due: Vec<&Row> = inner.rows.iter().filter(|r| r.is_candidate(now)).collect();
        // Damaged rows (no unlock_at) sort first, like NULLs in SQLite.
        due.sort_by_key(|r| (r.unlock_at, r.id));
        Ok(due
            .into_iter()
            .take(limit)
            .map(|r| CandidateRow {
                id: r.id,
                owner: r.owner,
                title: r.title.clone(),
                unlock_at: r.unlock_at,
            })
            .collect())
    }

    fn claim(
        &self,
        id: CapsuleId,
        claimant: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        match inner.rows.iter_mut().find(|r| r.id == id) {
            Some(row) if row.state == CapsuleState::Locked && row.review_reason.is_none() => {
                row.state = CapsuleState::Unlocking;
                row.claimed_by = Some(claimant.to_string());
                row.claimed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn commit(&self, id: CapsuleId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        match inner.rows.iter_mut().find(|r| r.id == id) {
            Some(row) if row.state == CapsuleState::Unlocking => {
                row.state = CapsuleState::Unlocked;
                row.unlocked_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn flag_for_review(&self, id: CapsuleId, reason: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let row = inner
            .rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound)?;
        row.review_reason = Some(reason.to_string());
        Ok(())
    }

    fn stale_claims(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Capsule>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .rows
            .iter()
            .filter(|r| r.state == CapsuleState::Unlocking)
            .filter(|r| r.claimed_at.is_some_and(|at| at <= cutoff))
            .filter_map(Row::to_capsule)
            .take(limit)
            .collect())
    }
}
