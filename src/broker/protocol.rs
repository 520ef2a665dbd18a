//! Wire types exchanged with the broker and URL construction for task paths.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque `(id, capability)` pair addressing a task on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub id: String,
    pub cap: String,
}

impl TaskId {
    pub fn new(id: impl Into<String>, cap: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cap: cap.into(),
        }
    }

    /// Path segments `[cap, id]`, each percent-encoded on its own.
    pub fn path_segments(&self) -> [String; 2] {
        [encode_segment(&self.cap), encode_segment(&self.id)]
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.cap)
    }
}

/// Percent-encode a single path segment. Separators are encoded too.
pub fn encode_segment(raw: &str) -> String {
    urlencoding::encode(raw).into_owned()
}

/// Join a base URL and already-encoded path segments.
pub fn join_url(base: &str, segments: &[&str]) -> String {
    let base = base.trim_end_matches('/');
    if segments.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base, segments.join("/"))
}

/// Result of a long-poll: either nothing, or a pointer to claimable work.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollResponse {
    #[serde(default)]
    pub id: Option<TaskId>,
}

/// Full task body returned by a successful claim.
#[derive(Debug, Clone, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(default)]
    pub data: TaskData,
}

impl Task {
    pub fn capability(&self) -> &str {
        &self.id.cap
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskData {
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub fetch_files: Vec<FileReference>,
}

/// A file to materialize in the task's working directory before execution.
///
/// Acquisition precedence when several sources are set: `git_clone`, then
/// `s3_file`, then `get`. For `get`, auth precedence is login+password, then
/// `http_auth_header`, then `custom_header`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReference {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_clone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_auth_header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_header: Option<std::collections::BTreeMap<String, String>>,
}

/// Terminal status of a task, in the broker's tagged-duration encoding.
///
/// `{"success": secs}`, `{"failure": [message, secs]}`, `{"notExecuted": any}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Success(f64),
    Failure(String, f64),
    NotExecuted(Value),
}

impl TaskStatus {
    pub fn success(elapsed: Duration) -> Self {
        Self::Success(elapsed.as_secs_f64())
    }

    pub fn failure(message: impl Into<String>, elapsed: Duration) -> Self {
        Self::Failure(message.into(), elapsed.as_secs_f64())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Terminal report body for `POST /private/agent/task/resolve/{cap}/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultReport {
    pub id: TaskId,
    pub status: TaskStatus,
    pub output: Value,
    pub capability: String,
}

/// Progress body for `POST /private/agent/task/progress/{cap}/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub id: TaskId,
    pub stage: String,
    pub log_update: String,
}

/// Basic system information sent at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub os: String,
    pub cpu_arch: String,
    pub total_memory_mb: u64,
    pub gpu: Option<GpuInfo>,
    pub client: String,
    pub runtime: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuInfo {
    pub vendor: String,
    pub model: String,
    pub vram_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub capabilities: Vec<String>,
    pub tier: u8,
    pub capacity: u32,
    pub system_info: SystemInfo,
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub agent_id: String,
    pub key: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub agent_id: String,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}
