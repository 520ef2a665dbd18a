//! `TTS::kokoro`: speech synthesis through an OpenAI-style audio endpoint.
//!
//! Payload is either the text to speak or an object with `input` and
//! optional `model`, `voice`, `response_format`, `speed`. The audio comes back
//! base64-encoded in the output.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value, json};
use tracing::debug;

use super::{Completion, Executor, TaskContext};
use crate::broker::ProgressSink;
use crate::error::ExecError;

const DEFAULT_MODEL: &str = "model_q8f16";
const DEFAULT_VOICE: &str = "af_heart";
const DEFAULT_FORMAT: &str = "mp3";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const SERVICE: &str = "kokoro";

pub struct SpeechExecutor {
    client: reqwest::Client,
    url: String,
    api_key: Option<SecretString>,
}

impl SpeechExecutor {
    pub fn new(url: String, api_key: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            api_key,
        }
    }
}

/// Request body with defaults filled in.
fn build_request(payload: &Value) -> Result<Value, ExecError> {
    let mut body = match payload {
        Value::String(text) => {
            let mut map = Map::new();
            map.insert("input".into(), Value::String(text.clone()));
            map
        }
        Value::Object(map) => map.clone(),
        _ => {
            return Err(ExecError::InvalidPayload(
                "expected text or an object with 'input'".to_string(),
            ));
        }
    };
    match body.get("input") {
        Some(Value::String(s)) if !s.is_empty() => {}
        _ => {
            return Err(ExecError::InvalidPayload(
                "No 'input' text provided in payload.".to_string(),
            ));
        }
    }
    body.entry("model").or_insert_with(|| json!(DEFAULT_MODEL));
    body.entry("voice").or_insert_with(|| json!(DEFAULT_VOICE));
    body.entry("response_format")
        .or_insert_with(|| json!(DEFAULT_FORMAT));
    Ok(Value::Object(body))
}

#[async_trait]
impl Executor for SpeechExecutor {
    fn name(&self) -> &str {
        "tts"
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        _progress: &dyn ProgressSink,
    ) -> Result<Completion, ExecError> {
        let body = build_request(&ctx.payload)?;
        debug!(task_id = %ctx.id, url = %self.url, "Requesting speech synthesis");

        let mut request = self.client.post(&self.url).timeout(REQUEST_TIMEOUT).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        let resp = request.send().await.map_err(|e| ExecError::Api {
            service: SERVICE.to_string(),
            reason: e.to_string(),
            body: None,
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.ok();
            return Err(ExecError::Api {
                service: SERVICE.to_string(),
                reason: format!("server returned {status}"),
                body: text,
            });
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let audio = resp.bytes().await.map_err(|e| ExecError::Api {
            service: SERVICE.to_string(),
            reason: e.to_string(),
            body: None,
        })?;

        Ok(Completion::Success {
            output: json!({
                "content_type": content_type,
                "audio_data_base64": STANDARD.encode(&audio),
            }),
        })
    }
}
