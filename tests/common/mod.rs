//! Mock broker shared by the integration tests.
//!
//! An Axum server on a random port implementing the agent-facing broker
//! routes plus a small file server for download tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use offload_agent::broker::BrokerClient;
use offload_agent::config::EngineConfig;

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A call the broker received for a task: `(cap, id, body)`.
pub type TaskCall = (String, String, Value);

#[derive(Default)]
pub struct BrokerState {
    /// Full task bodies, handed out in order.
    pub pending: Mutex<VecDeque<Value>>,
    /// Force a status for poll / claim / resolve.
    pub poll_status: Mutex<Option<StatusCode>>,
    pub claim_status: Mutex<Option<StatusCode>>,
    pub resolve_status: Mutex<Option<StatusCode>>,
    /// Hold each poll this long before answering.
    pub poll_delay: Mutex<Option<Duration>>,
    pub claims: Mutex<Vec<(String, String)>>,
    pub progress: Mutex<Vec<TaskCall>>,
    pub results: Mutex<Vec<TaskCall>>,
    /// Paths served by the file routes.
    pub downloads: Mutex<Vec<String>>,
}

pub struct MockBroker {
    pub url: String,
    pub state: Arc<BrokerState>,
}

impl MockBroker {
    pub async fn push_task(&self, task: Value) {
        self.state.pending.lock().await.push_back(task);
    }

    pub fn client(&self) -> BrokerClient {
        BrokerClient::new(self.url.clone())
    }

    pub async fn results(&self) -> Vec<TaskCall> {
        self.state.results.lock().await.clone()
    }

    pub async fn progress(&self) -> Vec<TaskCall> {
        self.state.progress.lock().await.clone()
    }

    pub async fn downloads(&self) -> Vec<String> {
        self.state.downloads.lock().await.clone()
    }
}

/// Task body as returned by a claim.
pub fn task(id: &str, cap: &str, payload: Value) -> Value {
    json!({ "id": { "id": id, "cap": cap }, "data": { "payload": payload } })
}

/// Task body with files to fetch.
pub fn task_with_files(id: &str, cap: &str, payload: Value, files: Value) -> Value {
    json!({
        "id": { "id": id, "cap": cap },
        "data": { "payload": payload, "fetchFiles": files },
    })
}

/// Engine settings pointed at `data_dir` with short timeouts.
pub fn engine_config(data_dir: &Path) -> EngineConfig {
    EngineConfig {
        data_dir: data_dir.to_path_buf(),
        poll_timeout: Duration::from_secs(2),
        claim_timeout: Duration::from_secs(2),
        report_timeout: Duration::from_secs(2),
        progress_timeout: Duration::from_secs(2),
        loop_delay: Duration::from_millis(10),
        error_backoff: Duration::from_millis(10),
        ..EngineConfig::default()
    }
}

async fn poll(State(state): State<Arc<BrokerState>>) -> impl IntoResponse {
    let delay = *state.poll_delay.lock().await;
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    if let Some(status) = *state.poll_status.lock().await {
        return (status, "poll unavailable".to_string());
    }
    let body = match state.pending.lock().await.front() {
        Some(task) => json!({ "id": task["id"] }),
        None => Value::Null,
    };
    (StatusCode::OK, body.to_string())
}

async fn take(
    State(state): State<Arc<BrokerState>>,
    UrlPath((cap, id)): UrlPath<(String, String)>,
) -> impl IntoResponse {
    state.claims.lock().await.push((cap.clone(), id.clone()));
    if let Some(status) = *state.claim_status.lock().await {
        // A refused claim still consumes the pointer, as when another agent
        // won the race.
        state.pending.lock().await.pop_front();
        return (status, "already taken".to_string());
    }
    let mut pending = state.pending.lock().await;
    let index = pending
        .iter()
        .position(|t| t["id"]["id"] == id.as_str() && t["id"]["cap"] == cap.as_str());
    match index.and_then(|i| pending.remove(i)) {
        Some(task) => (StatusCode::OK, task.to_string()),
        None => (StatusCode::NOT_FOUND, "no such task".to_string()),
    }
}

async fn progress(
    State(state): State<Arc<BrokerState>>,
    UrlPath((cap, id)): UrlPath<(String, String)>,
    axum::Json(body): axum::Json<Value>,
) -> StatusCode {
    state.progress.lock().await.push((cap, id, body));
    StatusCode::OK
}

async fn resolve(
    State(state): State<Arc<BrokerState>>,
    UrlPath((cap, id)): UrlPath<(String, String)>,
    axum::Json(body): axum::Json<Value>,
) -> impl IntoResponse {
    state.results.lock().await.push((cap, id, body));
    match *state.resolve_status.lock().await {
        Some(status) => (status, "rejected".to_string()),
        None => (StatusCode::OK, json!({"message": "ok"}).to_string()),
    }
}

async fn register(axum::Json(body): axum::Json<Value>) -> impl IntoResponse {
    if body["apiKey"] != "good-key" {
        return (StatusCode::UNAUTHORIZED, "bad api key".to_string());
    }
    (
        StatusCode::OK,
        json!({"agentId": "agent-1", "key": "secret-1", "message": "registered"}).to_string(),
    )
}

async fn auth(axum::Json(body): axum::Json<Value>) -> impl IntoResponse {
    if body["agentId"] != "agent-1" || body["key"] != "secret-1" {
        return (StatusCode::UNAUTHORIZED, "bad credentials".to_string());
    }
    (
        StatusCode::OK,
        json!({"token": "jwt-1", "expiresIn": 3600}).to_string(),
    )
}

async fn ping(headers: HeaderMap) -> StatusCode {
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some("Bearer jwt-1") => StatusCode::OK,
        _ => StatusCode::UNAUTHORIZED,
    }
}

/// `/files/{name}`: `plain` is public, `basic` wants user:pass, `header`
/// wants `Authorization: Token abc`, `custom` wants `X-Api-Key: k1`.
async fn file(
    State(state): State<Arc<BrokerState>>,
    UrlPath(name): UrlPath<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let header = |key: &str| {
        headers
            .get(key)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let allowed = match name.as_str() {
        "plain" => true,
        // base64("user:pass")
        "basic" => header("authorization").as_deref() == Some("Basic dXNlcjpwYXNz"),
        "header" => header("authorization").as_deref() == Some("Token abc"),
        "custom" => header("x-api-key").as_deref() == Some("k1"),
        _ => return (StatusCode::NOT_FOUND, "missing".to_string()),
    };
    if !allowed {
        return (StatusCode::UNAUTHORIZED, "denied".to_string());
    }
    state.downloads.lock().await.push(name.clone());
    (StatusCode::OK, format!("remote {name}\n"))
}

pub fn routes(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route("/private/agent/task/poll", get(poll))
        .route("/private/agent/take/{cap}/{id}", post(take))
        .route("/private/agent/task/progress/{cap}/{id}", post(progress))
        .route("/private/agent/task/resolve/{cap}/{id}", post(resolve))
        .route("/private/agent/ping", get(ping))
        .route("/agent/register", post(register))
        .route("/agent/auth", post(auth))
        .route("/files/{name}", get(file))
        .with_state(state)
}

/// Serve `app` on a random local port and return its base URL.
pub async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://127.0.0.1:{port}")
}

pub async fn start_broker() -> MockBroker {
    let state = Arc::new(BrokerState::default());
    let url = serve(routes(Arc::clone(&state))).await;
    MockBroker { url, state }
}
