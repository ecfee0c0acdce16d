//! User accounts and their device endpoints.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::capsule::{UserId, ValidationError};
use crate::persistence::{TimeLoopDb, from_millis, to_millis};
use crate::store::StoreError;

pub const MAX_USERNAME_LEN: usize = 50;
pub const MAX_EMAIL_LEN: usize = 100;

/// A registered user. The password hash never leaves the crate through serde.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub profile_image: Option<String>,
    #[serde(skip_serializing, default)]
    pub push_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Where a user can be reached by push.
pub trait DeviceDirectory: Send + Sync {
    /// `None` means the user has no registered device.
    fn push_token(&self, user: UserId) -> Result<Option<String>, StoreError>;
}

const USER_COLUMNS: &str =
    "id, username, email, password_hash, profile_image, push_token, created_at";

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    let created_at: i64 = row.get(6)?;
    Ok(UserRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        profile_image: row.get(4)?,
        push_token: row.get(5)?,
        created_at: from_millis(created_at).unwrap_or_default(),
    })
}

impl TimeLoopDb {
    /// Create a user. Username and email must be unique.
    pub fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<UserRecord, StoreError> {
        let username = username.trim();
        let email = email.trim().to_lowercase();
        if username.is_empty() || username.chars().count() > MAX_USERNAME_LEN {
            return Err(ValidationError::InvalidUsername(MAX_USERNAME_LEN).into());
        }
        if !email.contains('@') || email.chars().count() > MAX_EMAIL_LEN {
            return Err(ValidationError::InvalidEmail.into());
        }

        let id = {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO users (username, email, password_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![username, email, password_hash, to_millis(now)],
            )
            .map_err(|e| match StoreError::from(e) {
                StoreError::Conflict(_) => {
                    StoreError::Conflict("username or email already registered".into())
                }
                other => other,
            })?;
            conn.last_insert_rowid()
        };
        tracing::info!("👤 User {id} registered ({username})");
        self.get_user(id)?.ok_or(StoreError::NotFound)
    }

    pub fn get_user(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                [id],
                row_to_user,
            )
            .optional()?)
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                [email.trim().to_lowercase()],
                row_to_user,
            )
            .optional()?)
    }

    /// Register or clear (`None`) the user's device token.
    pub fn set_push_token(&self, user: UserId, token: Option<&str>) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let token = token.map(str::trim).filter(|t| !t.is_empty());
        let changed = conn.execute(
            "UPDATE users SET push_token = ?2 WHERE id = ?1",
            params![user, token],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

impl DeviceDirectory for TimeLoopDb {
    fn push_token(&self, user: UserId) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        let token = conn
            .query_row("SELECT push_token FROM users WHERE id = ?1", [user], |r| {
                r.get::<_, Option<String>>(0)
            })
            .optional()?;
        Ok(token.flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_find_user() {
        let db = TimeLoopDb::open_in_memory().unwrap();
        let user = db.create_user("mai", "Mai@Example.com", "hash", Utc::now()).unwrap();
        assert_eq!(user.email, "mai@example.com");

        let found = db.find_user_by_email("MAI@example.com ").unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(found.password_hash, "hash");
        assert!(db.find_user_by_email("nobody@example.com").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_email_conflicts() {
        let db = TimeLoopDb::open_in_memory().unwrap();
        db.create_user("a", "same@example.com", "h", Utc::now()).unwrap();
        let err = db.create_user("b", "same@example.com", "h", Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn test_rejects_bad_identity() {
        let db = TimeLoopDb::open_in_memory().unwrap();
        assert!(matches!(
            db.create_user("", "a@example.com", "h", Utc::now()),
            Err(StoreError::Invalid(ValidationError::InvalidUsername(_)))
        ));
        assert!(matches!(
            db.create_user("a", "not-an-email", "h", Utc::now()),
            Err(StoreError::Invalid(ValidationError::InvalidEmail))
        ));
    }

    #[test]
    fn test_push_token_lifecycle() {
        let db = TimeLoopDb::open_in_memory().unwrap();
        let user = db.create_user("tam", "tam@example.com", "h", Utc::now()).unwrap();
        assert_eq!(db.push_token(user.id).unwrap(), None);

        db.set_push_token(user.id, Some("device-123")).unwrap();
        assert_eq!(db.push_token(user.id).unwrap().as_deref(), Some("device-123"));

        db.set_push_token(user.id, Some("  ")).unwrap();
        assert_eq!(db.push_token(user.id).unwrap(), None);

        assert!(matches!(db.set_push_token(999, Some("x")), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_hash_not_serialized() {
        let db = TimeLoopDb::open_in_memory().unwrap();
        let user = db.create_user("lan", "lan@example.com", "secret-hash", Utc::now()).unwrap();
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("secret-hash"));
    }
}
