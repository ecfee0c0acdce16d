//! HTTP server implementation using Axum.

use axum::{
    Router, middleware,
    extract::State,
    routing::{get, post, put},
};
use std::future::Future;
use std::sync::Arc;
use timeloop_core::config::ServerConfig;
use timeloop_scheduler::{Clock, TimeLoopDb};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::error::ApiError;
use crate::routes;

/// Shared state for the API server.
pub struct AppState {
    pub db: Arc<TimeLoopDb>,
    pub clock: Arc<dyn Clock>,
    pub jwt_secret: String,
    pub token_ttl: chrono::Duration,
    /// bcrypt work factor for new password hashes.
    pub bcrypt_cost: u32,
    pub cors_origins: Vec<String>,
}

impl AppState {
    pub fn new(db: Arc<TimeLoopDb>, clock: Arc<dyn Clock>, config: &ServerConfig) -> Self {
        Self {
            db,
            clock,
            jwt_secret: config.jwt_secret.clone(),
            token_ttl: chrono::Duration::hours(config.token_ttl_hours as i64),
            bcrypt_cost: bcrypt::DEFAULT_COST,
            cors_origins: config.cors_origins.clone(),
        }
    }
}

/// JWT auth middleware. Validates `Authorization: Bearer <token>` and stores
/// the claims as a request extension.
async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    let auth_header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if let Some(token) = auth_header.strip_prefix("Bearer ")
        && let Ok(claims) = auth::validate_token(token.trim(), &state.jwt_secret)
    {
        req.extensions_mut().insert(claims);
        return next.run(req).await;
    }

    axum::response::IntoResponse::into_response(ApiError::Unauthorized(
        "invalid or missing token".into(),
    ))
}

/// Cross-origin access for the configured origins only. With none configured
/// no `Access-Control-Allow-Origin` is sent, so browsers keep same-origin.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers(Any)
        .max_age(std::time::Duration::from_secs(3600));

    let origins: Vec<_> = origins
        .iter()
        .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
        .collect();
    if origins.is_empty() {
        cors
    } else {
        cors.allow_origin(origins)
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    // Protected routes require a valid JWT
    let protected = Router::new()
        .route("/api/capsules", post(routes::create_capsule))
        .route("/api/capsules/my-capsules", get(routes::my_capsules))
        .route("/api/users/me/push-token", put(routes::set_push_token))
        .route("/api/notifications", get(routes::list_notifications))
        .route("/api/notifications/{id}/read", post(routes::mark_notification_read))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public = Router::new()
        .route("/health", get(routes::health_check))
        .route("/api/auth/register", post(routes::register))
        .route("/api/auth/login", post(routes::login));

    protected
        .merge(public)
        .layer(cors_layer(&state.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn start(
    state: Arc<AppState>,
    host: &str,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    if state.jwt_secret == timeloop_core::config::DEFAULT_JWT_SECRET {
        tracing::warn!("⚠️ Using the built-in JWT secret; set JWT_SECRET in production");
    }
    let app = build_router(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 TimeLoop API listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("🌐 API server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, header};
    use timeloop_scheduler::SystemClock;
    use tower::ServiceExt;

    fn router(cors_origins: Vec<String>) -> Router {
        let db = Arc::new(TimeLoopDb::open_in_memory().unwrap());
        let config = ServerConfig { cors_origins, ..ServerConfig::default() };
        build_router(Arc::new(AppState::new(db, Arc::new(SystemClock), &config)))
    }

    async fn allowed_origin(app: Router, origin: &str) -> Option<String> {
        let req = Request::builder()
            .uri("/health")
            .header(header::ORIGIN, origin)
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        resp.headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .map(|v| v.to_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn test_default_config_grants_no_cross_origin_access() {
        assert_eq!(allowed_origin(router(Vec::new()), "https://evil.example").await, None);
    }

    #[tokio::test]
    async fn test_only_configured_origins_are_allowed() {
        let origins = vec!["https://app.timeloop.example".to_string()];
        assert_eq!(
            allowed_origin(router(origins.clone()), "https://app.timeloop.example").await.as_deref(),
            Some("https://app.timeloop.example")
        );
        assert_eq!(allowed_origin(router(origins), "https://evil.example").await, None);
    }
}
