//! API route handlers.

use axum::{
    Extension, Json,
    extract::{Path, State},
};
use serde::Deserialize;
use std::sync::Arc;
use timeloop_scheduler::capsule::parse_unlock_date;
use timeloop_scheduler::{
    Capsule, CapsuleStore, Inbox, InboxEntry, NewCapsule, ValidationError, Visibility,
};

use crate::auth::{self, Claims};
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Unread notifications returned per request.
pub const INBOX_PAGE: usize = 50;
pub const MIN_PASSWORD_LEN: usize = 6;

/// Health check endpoint.
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "timeloop",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ─── Auth ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterReq {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginReq {
    pub email: String,
    pub password: String,
}

fn session(state: &AppState, user: &timeloop_scheduler::UserRecord) -> ApiResult<Json<serde_json::Value>> {
    let token = auth::create_token(
        user.id,
        &user.email,
        &state.jwt_secret,
        state.clock.now(),
        state.token_ttl,
    )?;
    Ok(Json(serde_json::json!({ "token": token, "user": user })))
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterReq>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::BadRequest(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    // bcrypt is CPU-bound; keep it off the async workers
    let password = req.password.clone();
    let cost = state.bcrypt_cost;
    let hash = tokio::task::spawn_blocking(move || auth::hash_password(&password, cost))
        .await
        .map_err(|e| ApiError::Internal(format!("hashing task failed: {e}")))??;

    let user = state
        .db
        .create_user(&req.username, &req.email, &hash, state.clock.now())?;
    session(&state, &user)
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginReq>,
) -> ApiResult<Json<serde_json::Value>> {
    let invalid = || ApiError::Unauthorized("Invalid credentials".into());

    tracing::debug!("login: querying user {}", req.email);
    let user = state.db.find_user_by_email(&req.email)?.ok_or_else(invalid)?;

    let password = req.password.clone();
    let hash = user.password_hash.clone();
    let ok = tokio::task::spawn_blocking(move || auth::verify_password(&password, &hash))
        .await
        .unwrap_or(false);
    if !ok {
        tracing::info!("🔒 Failed login for {}", req.email);
        return Err(invalid());
    }
    session(&state, &user)
}

// ─── Capsules ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateCapsuleReq {
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
    pub unlock_date: String,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
}

impl CreateCapsuleReq {
    fn into_new_capsule(self, owner: timeloop_scheduler::UserId) -> Result<NewCapsule, ValidationError> {
        let visibility = match self.visibility.as_deref().map(str::trim) {
            None | Some("") => Visibility::default(),
            Some(raw) => Visibility::parse(&raw.to_lowercase())
                .ok_or_else(|| ValidationError::UnknownVisibility(raw.to_string()))?,
        };
        let new = NewCapsule {
            owner,
            title: self.title,
            content: self.content,
            media_url: self.media_url,
            media_type: self.media_type,
            unlock_at: parse_unlock_date(&self.unlock_date)?,
            visibility,
        };
        new.validate()?;
        Ok(new)
    }
}

pub async fn create_capsule(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateCapsuleReq>,
) -> ApiResult<Json<Capsule>> {
    let new = req.into_new_capsule(claims.sub)?;
    let capsule = state.db.insert(&new, state.clock.now())?;
    tracing::info!(
        "📦 Capsule {} created by user {}, unlocks {}",
        capsule.id,
        capsule.owner,
        capsule.unlock_at
    );
    Ok(Json(capsule))
}

pub async fn my_capsules(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<Capsule>>> {
    Ok(Json(state.db.list_by_owner(claims.sub)?))
}

// ─── Devices & inbox ──────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PushTokenReq {
    #[serde(default)]
    pub token: Option<String>,
}

pub async fn set_push_token(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PushTokenReq>,
) -> ApiResult<Json<serde_json::Value>> {
    state.db.set_push_token(claims.sub, req.token.as_deref())?;
    Ok(Json(serde_json::json!({"ok": true})))
}

pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<InboxEntry>>> {
    Ok(Json(state.db.unread(claims.sub, INBOX_PAGE)?))
}

pub async fn mark_notification_read(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    state.db.mark_read(id, claims.sub, state.clock.now())?;
    Ok(Json(serde_json::json!({"ok": true})))
}
