//! SQLite-backed persistence for capsules, users, the in-app inbox and the
//! delivery retry queue.
//!
//! Timestamps are stored as unix milliseconds so `unlock_at <= ?` compares
//! numerically. Claim and commit are single conditional `UPDATE`s; the
//! affected-row count decides who owns a capsule.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::capsule::{
    CandidateRow, Capsule, CapsuleId, CapsuleState, NewCapsule, UserId, Visibility,
};
use crate::store::{CapsuleStore, StoreError};

/// TimeLoop database handle.
pub struct TimeLoopDb {
    conn: Mutex<Connection>,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(e.to_string())
            }
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

const CAPSULE_COLUMNS: &str = "id, owner_id, title, content, media_url, media_type, unlock_at, \
     visibility, state, created_at, claimed_by, claimed_at, unlocked_at, needs_review";

impl TimeLoopDb {
    /// Open or create the database. `:memory:` gives a private in-memory database.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if path != Path::new(":memory:")
            && let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty())
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // WAL lets list queries run while a sweeper holds the write lock.
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(Path::new(":memory:"))
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {e}")))
    }

    /// Run schema migrations.
    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                profile_image TEXT,
                push_token TEXT,
                created_at INTEGER NOT NULL
            );

            -- owner_id / unlock_at are nullable only so damaged imports can be
            -- surfaced and flagged instead of breaking the sweep.
            CREATE TABLE IF NOT EXISTS capsules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id INTEGER,
                title TEXT NOT NULL,
                content TEXT,
                media_url TEXT,
                media_type TEXT,
                unlock_at INTEGER,
                visibility TEXT NOT NULL DEFAULT 'private',
                state TEXT NOT NULL DEFAULT 'locked',     -- locked, unlocking, unlocked
                claimed_by TEXT,
                claimed_at INTEGER,
                unlocked_at INTEGER,
                needs_review INTEGER NOT NULL DEFAULT 0,
                review_reason TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_capsules_due
                ON capsules (state, needs_review, unlock_at);
            CREATE INDEX IF NOT EXISTS idx_capsules_owner
                ON capsules (owner_id, unlock_at);

            -- In-app notification inbox
            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                data TEXT NOT NULL DEFAULT '{}',
                read INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                read_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_unread
                ON notifications (user_id, read, created_at);

            -- Failed deliveries awaiting retry
            CREATE TABLE IF NOT EXISTS delivery_retries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                capsule_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                next_attempt_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',  -- pending, delivered, dropped, dead
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_retries_due
                ON delivery_retries (status, next_attempt_at);
            ",
        )?;
        Ok(())
    }

    fn row_to_capsule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<Capsule>> {
        let owner: Option<i64> = row.get(1)?;
        let unlock_at: Option<i64> = row.get(6)?;
        let visibility: String = row.get(7)?;
        let state: String = row.get(8)?;
        let created_at: i64 = row.get(9)?;
        let claimed_at: Option<i64> = row.get(11)?;
        let unlocked_at: Option<i64> = row.get(12)?;

        let (Some(owner), Some(unlock_at), Some(state)) = (
            owner,
            unlock_at.and_then(from_millis),
            CapsuleState::parse(&state),
        ) else {
            return Ok(None);
        };

        Ok(Some(Capsule {
            id: row.get(0)?,
            owner,
            title: row.get(2)?,
            content: row.get(3)?,
            media_url: row.get(4)?,
            media_type: row.get(5)?,
            unlock_at,
            visibility: Visibility::parse(&visibility).unwrap_or_default(),
            state,
            created_at: from_millis(created_at).unwrap_or(unlock_at),
            claimed_by: row.get(10)?,
            claimed_at: claimed_at.and_then(from_millis),
            unlocked_at: unlocked_at.and_then(from_millis),
            needs_review: row.get::<_, i64>(13)? != 0,
        }))
    }

    /// Review reason recorded for a flagged capsule.
    pub fn review_reason(&self, id: CapsuleId) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        let reason = conn
            .query_row(
                "SELECT review_reason FROM capsules WHERE id = ?1",
                [id],
                |r| r.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(reason.flatten())
    }

    /// Insert a row without validation, modelling a damaged import.
    #[cfg(test)]
    pub(crate) fn insert_raw(
        &self,
        owner: Option<UserId>,
        title: &str,
        unlock_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> CapsuleId {
        let conn = self.conn().unwrap();
        conn.execute(
            "INSERT INTO capsules (owner_id, title, unlock_at, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![owner, title, unlock_at.map(to_millis), to_millis(now)],
        )
        .unwrap();
        conn.last_insert_rowid()
    }
}

impl CapsuleStore for TimeLoopDb {
    fn insert(&self, new: &NewCapsule, now: DateTime<Utc>) -> Result<Capsule, StoreError> {
        new.validate()?;
        let id = {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO capsules
                 (owner_id, title, content, media_url, media_type, unlock_at, visibility, state, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'locked', ?8)",
                params![
                    new.owner,
                    new.title.trim(),
                    new.content,
                    new.media_url,
                    new.media_type,
                    to_millis(new.unlock_at),
                    new.visibility.as_str(),
                    to_millis(now),
                ],
            )?;
            conn.last_insert_rowid()
        };
        tracing::debug!("💾 Capsule {id} stored for user {}", new.owner);
        self.get(id)?.ok_or(StoreError::NotFound)
    }

    fn get(&self, id: CapsuleId) -> Result<Option<Capsule>, StoreError> {
        let conn = self.conn()?;
        let capsule = conn
            .query_row(
                &format!("SELECT {CAPSULE_COLUMNS} FROM capsules WHERE id = ?1"),
                [id],
                Self::row_to_capsule,
            )
            .optional()?;
        Ok(capsule.flatten())
    }

    fn list_by_owner(&self, owner: UserId) -> Result<Vec<Capsule>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CAPSULE_COLUMNS} FROM capsules WHERE owner_id = ?1 ORDER BY unlock_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map([owner], Self::row_to_capsule)?;
        let mut capsules = Vec::new();
        for row in rows {
            if let Some(capsule) = row? {
                capsules.push(capsule);
            }
        }
        Ok(capsules)
    }

    fn due_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CandidateRow>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, title, unlock_at FROM capsules
             WHERE state = 'locked' AND needs_review = 0
               AND (unlock_at IS NULL OR owner_id IS NULL OR unlock_at <= ?1)
             ORDER BY unlock_at ASC, id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![to_millis(now), limit as i64], |row| {
            let unlock_at: Option<i64> = row.get(3)?;
            Ok(CandidateRow {
                id: row.get(0)?,
                owner: row.get(1)?,
                title: row.get(2)?,
                unlock_at: unlock_at.and_then(from_millis),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn claim(
        &self,
        id: CapsuleId,
        claimant: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE capsules SET state = 'unlocking', claimed_by = ?2, claimed_at = ?3
             WHERE id = ?1 AND state = 'locked' AND needs_review = 0",
            params![id, claimant, to_millis(now)],
        )?;
        Ok(changed == 1)
    }

    fn commit(&self, id: CapsuleId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE capsules SET state = 'unlocked', unlocked_at = ?2
             WHERE id = ?1 AND state = 'unlocking'",
            params![id, to_millis(now)],
        )?;
        Ok(changed == 1)
    }

    fn flag_for_review(&self, id: CapsuleId, reason: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE capsules SET needs_review = 1, review_reason = ?2 WHERE id = ?1",
            params![id, reason],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn stale_claims(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Capsule>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CAPSULE_COLUMNS} FROM capsules
             WHERE state = 'unlocking' AND claimed_at <= ?1
             ORDER BY claimed_at ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![to_millis(cutoff), limit as i64], Self::row_to_capsule)?;
        let mut capsules = Vec::new();
        for row in rows {
            if let Some(capsule) = row? {
                capsules.push(capsule);
            }
        }
        Ok(capsules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap()
    }

    fn new_capsule(owner: UserId, title: &str, unlock_at: DateTime<Utc>) -> NewCapsule {
        NewCapsule {
            owner,
            title: title.into(),
            content: None,
            media_url: Some("https://cdn.example/a.jpg".into()),
            media_type: Some("image/jpeg".into()),
            unlock_at,
            visibility: Visibility::Shared,
        }
    }

    #[test]
    fn test_open_and_migrate_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timeloop.db");
        {
            let db = TimeLoopDb::open(&path).unwrap();
            db.insert(&new_capsule(1, "persisted", t0()), t0()).unwrap();
        }
        let db = TimeLoopDb::open(&path).unwrap();
        assert_eq!(db.list_by_owner(1).unwrap().len(), 1);
    }

    #[test]
    fn test_open_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh-home").join(".timeloop").join("timeloop.db");
        let db = TimeLoopDb::open(&path).unwrap();
        db.insert(&new_capsule(1, "first run", t0()), t0()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_insert_and_get_roundtrip_fields() {
        let db = TimeLoopDb::open_in_memory().unwrap();
        let c = db.insert(&new_capsule(3, "  trip  ", t0()), t0()).unwrap();
        assert_eq!(c.title, "trip");
        assert_eq!(c.owner, 3);
        assert_eq!(c.visibility, Visibility::Shared);
        assert_eq!(c.state, CapsuleState::Locked);
        assert_eq!(c.unlock_at, t0());
        assert_eq!(c.media_type.as_deref(), Some("image/jpeg"));
        assert!(!c.needs_review);
    }

    #[test]
    fn test_conditional_claim_and_commit() {
        let db = TimeLoopDb::open_in_memory().unwrap();
        let c = db.insert(&new_capsule(1, "c", t0()), t0()).unwrap();

        assert!(!db.commit(c.id, t0()).unwrap());
        assert!(db.claim(c.id, "sweeper-a", t0()).unwrap());
        assert!(!db.claim(c.id, "sweeper-b", t0()).unwrap());
        assert!(db.commit(c.id, t0()).unwrap());
        assert!(!db.commit(c.id, t0()).unwrap());

        let stored = db.get(c.id).unwrap().unwrap();
        assert_eq!(stored.state, CapsuleState::Unlocked);
        assert_eq!(stored.claimed_by.as_deref(), Some("sweeper-a"));
        assert_eq!(stored.unlocked_at, Some(t0()));
    }

    #[test]
    fn test_claim_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let a = TimeLoopDb::open(&path).unwrap();
        let b = TimeLoopDb::open(&path).unwrap();
        let c = a.insert(&new_capsule(1, "c", t0()), t0()).unwrap();

        assert!(b.claim(c.id, "b", t0()).unwrap());
        assert!(!a.claim(c.id, "a", t0()).unwrap());
    }

    #[test]
    fn test_due_candidates_include_damaged_rows_first() {
        let db = TimeLoopDb::open_in_memory().unwrap();
        db.insert(&new_capsule(1, "due", t0() - Duration::hours(1)), t0()).unwrap();
        db.insert(&new_capsule(1, "future", t0() + Duration::hours(1)), t0()).unwrap();
        let broken = db.insert_raw(Some(1), "no date", None, t0());

        let due = db.due_candidates(t0(), 10).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, broken);
        assert_eq!(due[0].unlock_at, None);
        assert_eq!(due[1].title, "due");

        db.flag_for_review(broken, "missing unlock_at").unwrap();
        assert_eq!(db.due_candidates(t0(), 10).unwrap().len(), 1);
        assert_eq!(db.review_reason(broken).unwrap().as_deref(), Some("missing unlock_at"));
    }

    #[test]
    fn test_flag_unknown_capsule() {
        let db = TimeLoopDb::open_in_memory().unwrap();
        assert!(matches!(db.flag_for_review(99, "x"), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_stale_claims() {
        let db = TimeLoopDb::open_in_memory().unwrap();
        let c = db.insert(&new_capsule(1, "c", t0()), t0()).unwrap();
        db.claim(c.id, "crashed", t0()).unwrap();

        assert!(db.stale_claims(t0() - Duration::seconds(1), 10).unwrap().is_empty());
        let stale = db.stale_claims(t0(), 10).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].state, CapsuleState::Unlocking);
    }
}
