//! Capsule definitions: the data model the sweeper drives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type CapsuleId = i64;
pub type UserId = i64;

pub const MAX_TITLE_LEN: usize = 200;

/// Unlock state. Only ever moves forward: Locked → Unlocking → Unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapsuleState {
    Locked,
    /// Claimed by exactly one sweeper, commit pending.
    Unlocking,
    Unlocked,
}

impl CapsuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapsuleState::Locked => "locked",
            CapsuleState::Unlocking => "unlocking",
            CapsuleState::Unlocked => "unlocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "locked" => Some(CapsuleState::Locked),
            "unlocking" => Some(CapsuleState::Unlocking),
            "unlocked" => Some(CapsuleState::Unlocked),
            _ => None,
        }
    }
}

/// Who may see the capsule. Has no bearing on unlocking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Private,
    Shared,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Shared => "shared",
            Visibility::Public => "public",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(Visibility::Private),
            "shared" => Some(Visibility::Shared),
            "public" => Some(Visibility::Public),
            _ => None,
        }
    }
}

/// A stored time capsule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capsule {
    pub id: CapsuleId,
    pub owner: UserId,
    pub title: String,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
    pub unlock_at: DateTime<Utc>,
    pub visibility: Visibility,
    pub state: CapsuleState,
    pub created_at: DateTime<Utc>,
    /// Sweeper instance holding (or last holding) the claim.
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub unlocked_at: Option<DateTime<Utc>>,
    pub needs_review: bool,
}

impl Capsule {
    pub fn is_unlocked(&self) -> bool {
        self.state == CapsuleState::Unlocked
    }
}

/// Input for creating a capsule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCapsule {
    pub owner: UserId,
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    pub unlock_at: DateTime<Utc>,
    #[serde(default)]
    pub visibility: Visibility,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("title is required")]
    EmptyTitle,
    #[error("title exceeds {MAX_TITLE_LEN} characters")]
    TitleTooLong,
    #[error("unknown visibility '{0}'")]
    UnknownVisibility(String),
    #[error("invalid unlock date '{0}': expected RFC 3339")]
    InvalidUnlockDate(String),
    #[error("username must be 1-{0} characters")]
    InvalidUsername(usize),
    #[error("invalid email address")]
    InvalidEmail,
}

impl NewCapsule {
    /// An `unlock_at` in the past is accepted: the capsule is due on the next sweep.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        if title.chars().count() > MAX_TITLE_LEN {
            return Err(ValidationError::TitleTooLong);
        }
        Ok(())
    }
}

/// Parse a user-supplied unlock date.
pub fn parse_unlock_date(raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| ValidationError::InvalidUnlockDate(raw.to_string()))
}

/// A row returned by the candidate scan. Fields are optional because the scan
/// also surfaces damaged rows so they can be flagged.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRow {
    pub id: CapsuleId,
    pub owner: Option<UserId>,
    pub title: String,
    pub unlock_at: Option<DateTime<Utc>>,
}

/// A candidate that passed validation and is due.
#[derive(Debug, Clone, PartialEq)]
pub struct DueCapsule {
    pub id: CapsuleId,
    pub owner: UserId,
    pub title: String,
    pub unlock_at: DateTime<Utc>,
}

impl CandidateRow {
    /// Check the row is well-formed. `Err` carries the review reason.
    pub fn into_due(self) -> Result<DueCapsule, String> {
        let owner = match self.owner {
            Some(owner) if owner > 0 => owner,
            _ => return Err("missing owner".into()),
        };
        let Some(unlock_at) = self.unlock_at else {
            return Err("missing unlock_at".into());
        };
        Ok(DueCapsule {
            id: self.id,
            owner,
            title: self.title,
            unlock_at,
        })
    }
}

impl From<&Capsule> for DueCapsule {
    fn from(c: &Capsule) -> Self {
        Self {
            id: c.id,
            owner: c.owner,
            title: c.title.clone(),
            unlock_at: c.unlock_at,
        }
    }
}

/// Notification event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CapsuleUnlocked,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CapsuleUnlocked => "capsule_unlocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "capsule_unlocked" => Some(EventKind::CapsuleUnlocked),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data attached to a `capsule_unlocked` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub capsule_id: CapsuleId,
    pub title: String,
}

impl From<&DueCapsule> for NotificationPayload {
    fn from(c: &DueCapsule) -> Self {
        Self {
            capsule_id: c.id,
            title: c.title.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn new_capsule(title: &str) -> NewCapsule {
        NewCapsule {
            owner: 1,
            title: title.into(),
            content: None,
            media_url: None,
            media_type: None,
            unlock_at: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            visibility: Visibility::default(),
        }
    }

    #[test]
    fn test_past_unlock_date_is_valid() {
        assert!(new_capsule("hello past").validate().is_ok());
    }

    #[test]
    fn test_title_rules() {
        assert_eq!(new_capsule("   ").validate(), Err(ValidationError::EmptyTitle));
        let long = "x".repeat(MAX_TITLE_LEN + 1);
        assert_eq!(new_capsule(&long).validate(), Err(ValidationError::TitleTooLong));
        let exact = "é".repeat(MAX_TITLE_LEN);
        assert!(new_capsule(&exact).validate().is_ok());
    }

    #[test]
    fn test_parse_unlock_date() {
        let at = parse_unlock_date("2030-06-01T12:00:00+02:00").unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2030, 6, 1, 10, 0, 0).unwrap());
        assert!(matches!(
            parse_unlock_date("next tuesday"),
            Err(ValidationError::InvalidUnlockDate(_))
        ));
    }

    #[test]
    fn test_candidate_validation() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let ok = CandidateRow { id: 1, owner: Some(7), title: "t".into(), unlock_at: Some(at) };
        assert_eq!(ok.into_due().unwrap().owner, 7);

        let no_owner = CandidateRow { id: 2, owner: None, title: "t".into(), unlock_at: Some(at) };
        assert_eq!(no_owner.into_due().unwrap_err(), "missing owner");

        let no_date = CandidateRow { id: 3, owner: Some(7), title: "t".into(), unlock_at: None };
        assert_eq!(no_date.into_due().unwrap_err(), "missing unlock_at");
    }

    #[test]
    fn test_payload_wire_names() {
        let payload = NotificationPayload { capsule_id: 42, title: "Graduation".into() };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["capsuleId"], 42);
        assert_eq!(json["title"], "Graduation");
        assert_eq!(EventKind::CapsuleUnlocked.to_string(), "capsule_unlocked");
    }
}
