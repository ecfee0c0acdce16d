//! Notification dispatch: push gateway, HTTP webhook, in-app inbox and fan-out.
//!
//! A dispatcher never touches capsule state. It reports what happened and the
//! caller decides whether to queue a retry.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use timeloop_core::TimeLoopConfig;

use crate::accounts::DeviceDirectory;
use crate::capsule::{EventKind, NotificationPayload, UserId};
use crate::clock::Clock;
use crate::notify::{Inbox, Notification};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum DeliveryResult {
    Delivered,
    /// No reachable endpoint for this user. Nothing to retry.
    Deferred,
    /// Transient failure. Safe to retry later.
    Failed(String),
}

impl DeliveryResult {
    pub fn is_failed(&self) -> bool {
        matches!(self, DeliveryResult::Failed(_))
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn name(&self) -> &str;

    async fn dispatch(
        &self,
        user: UserId,
        kind: EventKind,
        payload: &NotificationPayload,
    ) -> DeliveryResult;
}

// ─── Push gateway ─────────────────────────────────────────

/// Sends a push message to the user's registered device through an
/// FCM-style HTTP gateway.
pub struct PushDispatcher {
    client: reqwest::Client,
    endpoint: String,
    server_key: String,
    devices: Arc<dyn DeviceDirectory>,
}

impl PushDispatcher {
    pub fn new(
        endpoint: impl Into<String>,
        server_key: impl Into<String>,
        devices: Arc<dyn DeviceDirectory>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            server_key: server_key.into(),
            devices,
        }
    }
}

#[async_trait]
impl Dispatcher for PushDispatcher {
    fn name(&self) -> &str {
        "push"
    }

    async fn dispatch(
        &self,
        user: UserId,
        kind: EventKind,
        payload: &NotificationPayload,
    ) -> DeliveryResult {
        let token = match self.devices.push_token(user) {
            Ok(Some(token)) => token,
            Ok(None) => {
                tracing::debug!("📵 User {user} has no push token, skipping push");
                return DeliveryResult::Deferred;
            }
            Err(e) => return DeliveryResult::Failed(format!("device lookup failed: {e}")),
        };

        let notification = Notification::render(kind, payload);
        let mut req = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "to": token,
                "notification": {
                    "title": notification.title,
                    "body": notification.body,
                },
                "data": {
                    "type": kind.as_str(),
                    "capsuleId": payload.capsule_id.to_string(),
                    "title": payload.title,
                },
            }))
            .timeout(HTTP_TIMEOUT);
        if !self.server_key.is_empty() {
            req = req.bearer_auth(&self.server_key);
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!("✅ Push sent to user {user}: {}", notification.title);
                DeliveryResult::Delivered
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                DeliveryResult::Failed(format!("push gateway error {status}: {body}"))
            }
            Err(e) => DeliveryResult::Failed(format!("push send failed: {e}")),
        }
    }
}

// ─── Webhook ──────────────────────────────────────────────

/// POSTs every event as JSON to a fixed URL.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
}

impl WebhookDispatcher {
    pub fn new(url: impl Into<String>, headers: Vec<(String, String)>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            headers,
        }
    }
}

#[async_trait]
impl Dispatcher for WebhookDispatcher {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn dispatch(
        &self,
        user: UserId,
        kind: EventKind,
        payload: &NotificationPayload,
    ) -> DeliveryResult {
        let notification = Notification::render(kind, payload);
        let mut req = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "user_id": user,
                "kind": kind.as_str(),
                "title": notification.title,
                "body": notification.body,
                "data": notification.data,
            }))
            .timeout(HTTP_TIMEOUT);

        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!("✅ Webhook notification sent to {}: {}", self.url, notification.title);
                DeliveryResult::Delivered
            }
            Ok(resp) => DeliveryResult::Failed(format!("webhook error {}", resp.status())),
            Err(e) => DeliveryResult::Failed(format!("webhook send failed: {e}")),
        }
    }
}

// ─── In-app inbox ─────────────────────────────────────────

pub struct InboxDispatcher {
    inbox: Arc<dyn Inbox>,
    clock: Arc<dyn Clock>,
}

impl InboxDispatcher {
    pub fn new(inbox: Arc<dyn Inbox>, clock: Arc<dyn Clock>) -> Self {
        Self { inbox, clock }
    }
}

#[async_trait]
impl Dispatcher for InboxDispatcher {
    fn name(&self) -> &str {
        "inbox"
    }

    async fn dispatch(
        &self,
        user: UserId,
        kind: EventKind,
        payload: &NotificationPayload,
    ) -> DeliveryResult {
        let notification = Notification::render(kind, payload);
        match self.inbox.push(user, &notification, self.clock.now()) {
            Ok(id) => {
                tracing::debug!("📥 Inbox notification {id} for user {user}");
                DeliveryResult::Delivered
            }
            Err(e) => DeliveryResult::Failed(format!("inbox write failed: {e}")),
        }
    }
}

// ─── Fan-out ──────────────────────────────────────────────

/// Delivers to every target concurrently. Delivered if any target delivered,
/// else Failed if any failed, else Deferred.
#[derive(Default)]
pub struct FanoutDispatcher {
    targets: Vec<Arc<dyn Dispatcher>>,
}

impl FanoutDispatcher {
    pub fn new(targets: Vec<Arc<dyn Dispatcher>>) -> Self {
        Self { targets }
    }

    pub fn with(mut self, target: Arc<dyn Dispatcher>) -> Self {
        self.targets.push(target);
        self
    }

    pub fn target_names(&self) -> Vec<&str> {
        self.targets.iter().map(|t| t.name()).collect()
    }
}

#[async_trait]
impl Dispatcher for FanoutDispatcher {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn dispatch(
        &self,
        user: UserId,
        kind: EventKind,
        payload: &NotificationPayload,
    ) -> DeliveryResult {
        let results = futures::future::join_all(
            self.targets.iter().map(|t| t.dispatch(user, kind, payload)),
        )
        .await;

        let mut failures = Vec::new();
        let mut delivered = false;
        for (target, result) in self.targets.iter().zip(results) {
            match result {
                DeliveryResult::Delivered => delivered = true,
                DeliveryResult::Deferred => {}
                DeliveryResult::Failed(reason) => {
                    tracing::warn!("⚠️ {} delivery failed for user {user}: {reason}", target.name());
                    failures.push(format!("{}: {reason}", target.name()));
                }
            }
        }

        if delivered {
            DeliveryResult::Delivered
        } else if !failures.is_empty() {
            DeliveryResult::Failed(failures.join("; "))
        } else {
            DeliveryResult::Deferred
        }
    }
}

/// Build the dispatcher chain described by the config. The inbox is always on;
/// push and webhook join when enabled with a target set.
pub fn dispatchers_from_config<S>(
    config: &TimeLoopConfig,
    db: Arc<S>,
    clock: Arc<dyn Clock>,
) -> FanoutDispatcher
where
    S: Inbox + DeviceDirectory + 'static,
{
    let mut fanout = FanoutDispatcher::default().with(Arc::new(InboxDispatcher::new(
        db.clone() as Arc<dyn Inbox>,
        clock,
    )));

    if config.push.enabled && !config.push.endpoint.is_empty() {
        fanout = fanout.with(Arc::new(PushDispatcher::new(
            config.push.endpoint.clone(),
            config.push.server_key.clone(),
            db as Arc<dyn DeviceDirectory>,
        )));
    }
    if config.webhook.enabled && !config.webhook.url.is_empty() {
        fanout = fanout.with(Arc::new(WebhookDispatcher::new(
            config.webhook.url.clone(),
            config.webhook.headers.clone(),
        )));
    }

    tracing::info!("📣 Notification channels: {}", fanout.target_names().join(", "));
    fanout
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::persistence::TimeLoopDb;
    use axum::{Json, Router, extract::State, http::HeaderMap, http::StatusCode, routing::post};
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Captured {
        requests: Arc<Mutex<Vec<(HeaderMap, serde_json::Value)>>>,
    }

    async fn record(
        State(captured): State<Captured>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        captured.requests.lock().unwrap().push((headers, body));
        StatusCode::OK
    }

    async fn always_500() -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    /// Spawn a local HTTP server and return its base URL.
    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn payload() -> NotificationPayload {
        NotificationPayload { capsule_id: 7, title: "Letters to 2030".into() }
    }

    fn db_with_user(token: Option<&str>) -> (Arc<TimeLoopDb>, UserId) {
        let db = Arc::new(TimeLoopDb::open_in_memory().unwrap());
        let user = db.create_user("hoa", "hoa@example.com", "h", Utc::now()).unwrap();
        db.set_push_token(user.id, token).unwrap();
        (db, user.id)
    }

    struct Fixed(&'static str, DeliveryResult);

    #[async_trait]
    impl Dispatcher for Fixed {
        fn name(&self) -> &str {
            self.0
        }
        async fn dispatch(&self, _: UserId, _: EventKind, _: &NotificationPayload) -> DeliveryResult {
            self.1.clone()
        }
    }

    #[tokio::test]
    async fn test_push_sends_to_registered_device() {
        let captured = Captured::default();
        let url = spawn(Router::new().route("/send", post(record)).with_state(captured.clone())).await;
        let (db, user) = db_with_user(Some("device-abc"));

        let push = PushDispatcher::new(format!("{url}/send"), "server-key", db);
        let result = push.dispatch(user, EventKind::CapsuleUnlocked, &payload()).await;
        assert_eq!(result, DeliveryResult::Delivered);

        let requests = captured.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let (headers, body) = &requests[0];
        assert_eq!(headers["authorization"], "Bearer server-key");
        assert_eq!(body["to"], "device-abc");
        assert_eq!(body["notification"]["title"], "🎉 Time Capsule Unlocked!");
        assert_eq!(body["data"]["type"], "capsule_unlocked");
        assert_eq!(body["data"]["capsuleId"], "7");
    }

    #[tokio::test]
    async fn test_push_without_token_is_deferred() {
        let (db, user) = db_with_user(None);
        // Endpoint is never contacted.
        let push = PushDispatcher::new("http://127.0.0.1:9/unused", "", db);
        let result = push.dispatch(user, EventKind::CapsuleUnlocked, &payload()).await;
        assert_eq!(result, DeliveryResult::Deferred);
    }

    #[tokio::test]
    async fn test_push_gateway_error_is_failed() {
        let url = spawn(Router::new().route("/send", post(always_500))).await;
        let (db, user) = db_with_user(Some("device-abc"));
        let push = PushDispatcher::new(format!("{url}/send"), "", db);
        let result = push.dispatch(user, EventKind::CapsuleUnlocked, &payload()).await;
        assert!(result.is_failed());
    }

    #[tokio::test]
    async fn test_webhook_posts_json_with_headers() {
        let captured = Captured::default();
        let url = spawn(Router::new().route("/hook", post(record)).with_state(captured.clone())).await;

        let hook = WebhookDispatcher::new(
            format!("{url}/hook"),
            vec![("X-TimeLoop-Token".into(), "s3cret".into())],
        );
        let result = hook.dispatch(42, EventKind::CapsuleUnlocked, &payload()).await;
        assert_eq!(result, DeliveryResult::Delivered);

        let requests = captured.requests.lock().unwrap();
        let (headers, body) = &requests[0];
        assert_eq!(headers["x-timeloop-token"], "s3cret");
        assert_eq!(body["user_id"], 42);
        assert_eq!(body["kind"], "capsule_unlocked");
        assert_eq!(body["data"]["title"], "Letters to 2030");
    }

    #[tokio::test]
    async fn test_webhook_unreachable_is_failed() {
        let hook = WebhookDispatcher::new("http://127.0.0.1:9/hook", vec![]);
        let result = hook.dispatch(1, EventKind::CapsuleUnlocked, &payload()).await;
        assert!(result.is_failed());
    }

    #[tokio::test]
    async fn test_inbox_dispatcher_writes_row() {
        let (db, user) = db_with_user(None);
        let inbox = InboxDispatcher::new(db.clone(), Arc::new(SystemClock));
        let result = inbox.dispatch(user, EventKind::CapsuleUnlocked, &payload()).await;
        assert_eq!(result, DeliveryResult::Delivered);

        let unread = db.unread(user, 50).unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].title, "🎉 Time Capsule Unlocked!");
        assert_eq!(unread[0].data["capsuleId"], 7);
    }

    #[tokio::test]
    async fn test_fanout_combines_outcomes() {
        let delivered: Arc<dyn Dispatcher> = Arc::new(Fixed("a", DeliveryResult::Delivered));
        let deferred: Arc<dyn Dispatcher> = Arc::new(Fixed("b", DeliveryResult::Deferred));
        let failed: Arc<dyn Dispatcher> =
            Arc::new(Fixed("c", DeliveryResult::Failed("down".into())));

        let any_delivered = FanoutDispatcher::new(vec![failed.clone(), delivered, deferred.clone()]);
        assert_eq!(
            any_delivered.dispatch(1, EventKind::CapsuleUnlocked, &payload()).await,
            DeliveryResult::Delivered
        );

        let some_failed = FanoutDispatcher::new(vec![deferred.clone(), failed]);
        assert_eq!(
            some_failed.dispatch(1, EventKind::CapsuleUnlocked, &payload()).await,
            DeliveryResult::Failed("c: down".into())
        );

        let all_deferred = FanoutDispatcher::new(vec![deferred]);
        assert_eq!(
            all_deferred.dispatch(1, EventKind::CapsuleUnlocked, &payload()).await,
            DeliveryResult::Deferred
        );
        assert_eq!(
            FanoutDispatcher::default().dispatch(1, EventKind::CapsuleUnlocked, &payload()).await,
            DeliveryResult::Deferred
        );
    }

    #[test]
    fn test_channels_from_config() {
        let db = Arc::new(TimeLoopDb::open_in_memory().unwrap());
        let mut config = TimeLoopConfig::default();
        let fanout = dispatchers_from_config(&config, db.clone(), Arc::new(SystemClock));
        assert_eq!(fanout.target_names(), vec!["inbox"]);

        config.push.enabled = true;
        config.push.endpoint = "https://push.example/send".into();
        config.webhook.enabled = true;
        let fanout = dispatchers_from_config(&config, db, Arc::new(SystemClock));
        // Webhook enabled but without a URL stays off.
        assert_eq!(fanout.target_names(), vec!["inbox", "push"]);
    }
}
