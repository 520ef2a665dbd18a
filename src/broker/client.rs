//! Authenticated HTTP transport to the broker.

use std::time::Duration;

use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::protocol::{
    AuthRequest, AuthResponse, PollResponse, ProgressReport, RegistrationRequest,
    RegistrationResponse, ResultReport, Task, TaskId, join_url,
};
use crate::error::TransportError;

/// Timeout for registration, authentication and ping calls.
const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Base address plus bearer credential. Cheap to clone; the credential is
/// fixed for the lifetime of a handle and replaced by building a new one.
#[derive(Clone)]
pub struct BrokerClient {
    base: String,
    token: Option<SecretString>,
    http: reqwest::Client,
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("base", &self.base)
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}

impl BrokerClient {
    /// Create an unauthenticated handle.
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            token: None,
            http: reqwest::Client::new(),
        }
    }

    /// Attach the bearer credential obtained from `/agent/auth`.
    pub fn with_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn token(&self) -> Option<&SecretString> {
        self.token.as_ref()
    }

    fn url(&self, segments: &[&str]) -> String {
        join_url(&self.base, segments)
    }

    fn task_url(&self, prefix: &[&str], id: &TaskId) -> String {
        let [cap, raw_id] = id.path_segments();
        let mut segments: Vec<&str> = prefix.to_vec();
        segments.push(&cap);
        segments.push(&raw_id);
        self.url(&segments)
    }

    fn request(&self, method: Method, url: &str, timeout: Duration) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url).timeout(timeout);
        match &self.token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }

    /// Send a request and return the body text of a 2xx reply.
    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<String, TransportError> {
        let resp = builder
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(url, e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| TransportError::from_reqwest(url, e))?;
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn post_json<B, R>(
        &self,
        url: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<R, TransportError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let builder = self.request(Method::POST, url, timeout).json(body);
        let text = self.send(builder, url).await?;
        serde_json::from_str(&text).map_err(|e| TransportError::InvalidResponse {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    /// Long-poll for a task pointer. `Ok(None)` means no work was available.
    pub async fn poll(&self, timeout: Duration) -> Result<Option<TaskId>, TransportError> {
        let url = self.url(&["private", "agent", "task", "poll"]);
        let text = self
            .send(self.request(Method::GET, &url, timeout), &url)
            .await?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        let parsed: Option<PollResponse> =
            serde_json::from_str(&text).map_err(|e| TransportError::InvalidResponse {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        Ok(parsed.and_then(|p| p.id))
    }

    /// Claim a polled pointer, converting it into the full task body.
    pub async fn claim(&self, id: &TaskId, timeout: Duration) -> Result<Task, TransportError> {
        let url = self.task_url(&["private", "agent", "take"], id);
        self.post_json(&url, &serde_json::json!({}), timeout).await
    }

    /// Submit the terminal report for a task.
    pub async fn report_result(
        &self,
        report: &ResultReport,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let url = self.task_url(&["private", "agent", "task", "resolve"], &report.id);
        let builder = self.request(Method::POST, &url, timeout).json(report);
        let body = self.send(builder, &url).await?;
        debug!(task_id = %report.id, response = %body, "Result accepted");
        Ok(())
    }

    /// Submit a progress update for a task.
    pub async fn report_progress(
        &self,
        report: &ProgressReport,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let url = self.task_url(&["private", "agent", "task", "progress"], &report.id);
        let builder = self.request(Method::POST, &url, timeout).json(report);
        self.send(builder, &url).await?;
        Ok(())
    }

    /// Liveness probe. Any transport failure counts as unhealthy.
    pub async fn ping(&self) -> bool {
        let url = self.url(&["private", "agent", "ping"]);
        match self
            .request(Method::GET, &url, LIFECYCLE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!(error = %e, "Ping failed");
                false
            }
        }
    }

    /// `POST /agent/register`.
    pub async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationResponse, TransportError> {
        let url = self.url(&["agent", "register"]);
        self.post_json(&url, request, LIFECYCLE_TIMEOUT).await
    }

    /// `POST /agent/auth`.
    pub async fn authenticate(
        &self,
        agent_id: &str,
        key: &SecretString,
    ) -> Result<AuthResponse, TransportError> {
        let url = self.url(&["agent", "auth"]);
        let body = AuthRequest {
            agent_id: agent_id.to_string(),
            key: key.expose_secret().to_string(),
        };
        self.post_json(&url, &body, LIFECYCLE_TIMEOUT).await
    }
}
