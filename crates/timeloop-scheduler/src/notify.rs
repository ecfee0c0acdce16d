//! Notification content and the in-app inbox.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::capsule::{EventKind, NotificationPayload, UserId};
use crate::persistence::{TimeLoopDb, from_millis, to_millis};
use crate::store::StoreError;

/// A rendered notification, ready for any channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: EventKind,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

impl Notification {
    pub fn render(kind: EventKind, payload: &NotificationPayload) -> Self {
        Self {
            kind,
            title: title_for(kind.as_str()).to_string(),
            body: body_for(kind, payload),
            data: serde_json::to_value(payload).unwrap_or_default(),
        }
    }
}

/// Title shown for an event kind. Unknown kinds get a generic title.
pub fn title_for(kind: &str) -> &'static str {
    match EventKind::parse(kind) {
        Some(EventKind::CapsuleUnlocked) => "🎉 Time Capsule Unlocked!",
        None => "TimeLoop Notification",
    }
}

pub fn body_for(kind: EventKind, payload: &NotificationPayload) -> String {
    match kind {
        EventKind::CapsuleUnlocked => {
            format!("Your time capsule \"{}\" is ready to open.", payload.title)
        }
    }
}

/// An in-app notification row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxEntry {
    pub id: i64,
    pub user_id: UserId,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub data: serde_json::Value,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

/// Per-user notification inbox.
pub trait Inbox: Send + Sync {
    fn push(
        &self,
        user: UserId,
        notification: &Notification,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Unread entries, newest first.
    fn unread(&self, user: UserId, limit: usize) -> Result<Vec<InboxEntry>, StoreError>;

    /// Mark one entry read. Only the owner may do so.
    fn mark_read(&self, id: i64, user: UserId, now: DateTime<Utc>) -> Result<(), StoreError>;
}

impl Inbox for TimeLoopDb {
    fn push(
        &self,
        user: UserId,
        notification: &Notification,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notifications (user_id, kind, title, message, data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user,
                notification.kind.as_str(),
                notification.title,
                notification.body,
                notification.data.to_string(),
                to_millis(now),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn unread(&self, user: UserId, limit: usize) -> Result<Vec<InboxEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, kind, title, message, data, read, created_at, read_at
             FROM notifications WHERE user_id = ?1 AND read = 0
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user, limit as i64], |row| {
            let data: String = row.get(5)?;
            let created_at: i64 = row.get(7)?;
            let read_at: Option<i64> = row.get(8)?;
            Ok(InboxEntry {
                id: row.get(0)?,
                user_id: row.get(1)?,
                kind: row.get(2)?,
                title: row.get(3)?,
                message: row.get(4)?,
                data: serde_json::from_str(&data).unwrap_or_default(),
                read: row.get::<_, i64>(6)? != 0,
                created_at: from_millis(created_at).unwrap_or_default(),
                read_at: read_at.and_then(from_millis),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn mark_read(&self, id: i64, user: UserId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE notifications SET read = 1, read_at = COALESCE(read_at, ?3)
             WHERE id = ?1 AND user_id = ?2",
            params![id, user, to_millis(now)],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
