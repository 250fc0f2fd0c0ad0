//! In-process hub server for integration tests.
//!
//! Serves the auth routes, the notification routes, one protected route and the
//! push WebSocket, with knobs to expire credentials, reject renewals and drop
//! push connections.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hub_client::{ClientConfig, ReconnectPolicy};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

pub const USER_ID: u64 = 7;
pub const IDENTIFIER: &str = "user@example.com";
pub const SECRET: &str = "secret";
pub const GOOGLE_TOKEN: &str = "google-ok";

/// Initialize tracing for tests
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
pub enum PushCommand {
    Send(String),
    /// Drop the socket without a close frame.
    Drop,
    /// Close with a normal close frame.
    Close,
}

#[derive(Default)]
pub struct HubState {
    next_token: AtomicU64,
    valid_access: Mutex<HashSet<String>>,
    valid_refresh: Mutex<HashSet<String>>,
    pub notifications: Mutex<Vec<Value>>,

    pub logins: AtomicUsize,
    pub renewals: AtomicUsize,
    pub protected_hits: AtomicUsize,
    pub ack_calls: AtomicUsize,
    pub ws_connections: AtomicUsize,
    pub handshakes: Mutex<Vec<Value>>,

    pub renewal_delay_ms: AtomicU64,
    pub list_delay_ms: AtomicU64,
    pub reject_renewals: AtomicBool,
    pub rotate_refresh: AtomicBool,
    pub reject_protected: AtomicBool,
    pub fail_acks: AtomicBool,
    /// Leave handshakes unanswered.
    pub silent_handshakes: AtomicBool,
    /// Answer every handshake with an error envelope.
    pub reject_handshakes: AtomicBool,

    push_tx: Mutex<Option<broadcast::Sender<PushCommand>>>,
}

impl HubState {
    fn issue_access(&self) -> String {
        let n = self.next_token.fetch_add(1, Ordering::SeqCst);
        let access = format!("access-{n}");
        self.valid_access.lock().insert(access.clone());
        access
    }

    fn issue_refresh(&self) -> String {
        let n = self.next_token.fetch_add(1, Ordering::SeqCst);
        let refresh = format!("refresh-{n}");
        self.valid_refresh.lock().insert(refresh.clone());
        refresh
    }

    fn issue_pair(&self) -> Value {
        json!({ "access": self.issue_access(), "refresh": self.issue_refresh() })
    }

    pub fn is_valid_access(&self, token: &str) -> bool {
        self.valid_access.lock().contains(token)
    }

    /// Invalidate every issued access credential.
    pub fn expire_access(&self) {
        self.valid_access.lock().clear();
    }

    /// Reject future renewals presenting `refresh`.
    pub fn revoke_refresh(&self, refresh: &str) {
        self.valid_refresh.lock().remove(refresh);
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| self.is_valid_access(token))
    }

    fn push_sender(&self) -> broadcast::Sender<PushCommand> {
        self.push_tx
            .lock()
            .get_or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    pub fn push(&self, text: impl Into<String>) {
        let _ = self.push_sender().send(PushCommand::Send(text.into()));
    }

    pub fn push_notification(&self, id: u64, message: &str) {
        let envelope = json!({
            "kind": "notification",
            "payload": {
                "id": id,
                "type": "like",
                "sender": "ana",
                "message": message,
                "is_read": false,
                "created_at": "2024-03-01 10:15",
            }
        });
        self.push(envelope.to_string());
    }

    pub fn drop_connections(&self) {
        let _ = self.push_sender().send(PushCommand::Drop);
    }

    pub fn close_connections(&self) {
        let _ = self.push_sender().send(PushCommand::Close);
    }

    pub fn seed_notifications(&self, items: Vec<Value>) {
        *self.notifications.lock() = items;
    }
}

pub struct TestHub {
    pub state: Arc<HubState>,
    pub addr: SocketAddr,
}

impl TestHub {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Client config with short timeouts and a fast reconnect policy.
    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(self.base_url())
            .with_request_timeout(Duration::from_secs(5))
            .with_handshake_timeout(Duration::from_secs(2))
            .with_heartbeat_interval(None)
            .with_reconnect(ReconnectPolicy::new(
                Duration::from_millis(50),
                Duration::from_millis(400),
                5,
            ))
    }
}

pub async fn spawn_hub() -> TestHub {
    init_tracing();
    let state = Arc::new(HubState::default());

    let app = Router::new()
        .route("/auth/jwt/create/", post(obtain_pair))
        .route("/auth/jwt/refresh/", post(renew))
        .route("/auth/google/", post(federated))
        .route("/auth/users/me/", get(me))
        .route("/api/protected/", get(protected))
        .route("/api/broken/", get(broken))
        .route("/api/notifications/", get(list_notifications))
        .route("/api/notifications/{id}/mark_as_read/", post(mark_one))
        .route("/api/notifications/mark_all_as_read/", post(mark_all))
        .route("/ws/notifications/", get(push_socket))
        .with_state(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestHub { state, addr }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "detail": "Given token not valid for any token type",
            "code": "token_not_valid",
        })),
    )
        .into_response()
}

async fn obtain_pair(State(hub): State<Arc<HubState>>, Json(body): Json<Value>) -> Response {
    hub.logins.fetch_add(1, Ordering::SeqCst);
    if body["identifier"] == IDENTIFIER && body["secret"] == SECRET {
        Json(hub.issue_pair()).into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "No active account found with the given credentials" })),
        )
            .into_response()
    }
}

async fn federated(State(hub): State<Arc<HubState>>, Json(body): Json<Value>) -> Response {
    if body["access_token"] == GOOGLE_TOKEN {
        Json(hub.issue_pair()).into_response()
    } else {
        (StatusCode::BAD_REQUEST, Json(json!({ "detail": "Invalid token" }))).into_response()
    }
}

async fn renew(State(hub): State<Arc<HubState>>, Json(body): Json<Value>) -> Response {
    hub.renewals.fetch_add(1, Ordering::SeqCst);
    let delay = hub.renewal_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let refresh = body["refresh"].as_str().unwrap_or_default().to_string();
    let known = hub.valid_refresh.lock().contains(&refresh);
    if !known || hub.reject_renewals.load(Ordering::SeqCst) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "Token is invalid or expired", "code": "token_not_valid" })),
        )
            .into_response();
    }

    if hub.rotate_refresh.load(Ordering::SeqCst) {
        hub.valid_refresh.lock().remove(&refresh);
        Json(json!({ "access": hub.issue_access(), "refresh": hub.issue_refresh() }))
            .into_response()
    } else {
        Json(json!({ "access": hub.issue_access() })).into_response()
    }
}

async fn me(State(hub): State<Arc<HubState>>, headers: HeaderMap) -> Response {
    if !hub.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "id": USER_ID, "username": "user", "email": IDENTIFIER, "first_name": "Uma" }))
        .into_response()
}

async fn protected(State(hub): State<Arc<HubState>>, headers: HeaderMap) -> Response {
    hub.protected_hits.fetch_add(1, Ordering::SeqCst);
    if hub.reject_protected.load(Ordering::SeqCst) || !hub.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "ok": true })).into_response()
}

async fn broken(State(hub): State<Arc<HubState>>, headers: HeaderMap) -> Response {
    if !hub.authorized(&headers) {
        return unauthorized();
    }
    (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
}

async fn list_notifications(State(hub): State<Arc<HubState>>, headers: HeaderMap) -> Response {
    if !hub.authorized(&headers) {
        return unauthorized();
    }
    let delay = hub.list_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    Json(Value::Array(hub.notifications.lock().clone())).into_response()
}

async fn mark_one(
    State(hub): State<Arc<HubState>>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> Response {
    if !hub.authorized(&headers) {
        return unauthorized();
    }
    hub.ack_calls.fetch_add(1, Ordering::SeqCst);
    if hub.fail_acks.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "unavailable").into_response();
    }
    let mut items = hub.notifications.lock();
    match items.iter_mut().find(|n| n["id"] == id) {
        Some(item) => {
            item["is_read"] = Value::Bool(true);
            Json(json!({ "status": "marked as read" })).into_response()
        }
        None => (StatusCode::NOT_FOUND, Json(json!({ "detail": "Not found." }))).into_response(),
    }
}

async fn mark_all(State(hub): State<Arc<HubState>>, headers: HeaderMap) -> Response {
    if !hub.authorized(&headers) {
        return unauthorized();
    }
    hub.ack_calls.fetch_add(1, Ordering::SeqCst);
    if hub.fail_acks.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "unavailable").into_response();
    }
    for item in hub.notifications.lock().iter_mut() {
        item["is_read"] = Value::Bool(true);
    }
    Json(json!({ "status": "all marked as read" })).into_response()
}

async fn push_socket(State(hub): State<Arc<HubState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| push_session(socket, hub))
}

async fn push_session(mut socket: WebSocket, hub: Arc<HubState>) {
    let mut commands = hub.push_sender().subscribe();
    hub.ws_connections.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
                    hub.handshakes.lock().push(value.clone());
                    if hub.silent_handshakes.load(Ordering::SeqCst) {
                        continue;
                    }
                    let accepted = value["type"] == "authenticate"
                        && value["user_id"] == USER_ID
                        && hub.is_valid_access(value["token"].as_str().unwrap_or_default())
                        && !hub.reject_handshakes.load(Ordering::SeqCst);
                    let reply = if accepted {
                        json!({ "kind": "ack" })
                    } else {
                        json!({ "kind": "error", "message": "unauthorized" })
                    };
                    if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Ok(PushCommand::Send(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                Ok(PushCommand::Drop) | Err(_) => return,
                Ok(PushCommand::Close) => {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: 1000,
                            reason: "bye".into(),
                        })))
                        .await;
                    return;
                }
            },
        }
    }
}
