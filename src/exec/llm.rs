//! `LLM::<model>`: chat queries against the local Ollama service.
//!
//! Non-streaming requests are forwarded with `stream: false` and the response
//! body becomes the task output. Streaming requests (`"stream": true` in an
//! object payload) read newline-delimited JSON records, accumulate the
//! generated text, and flush it as progress every `flush_interval`. The final
//! output has the same shape as a non-streaming response.

use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{Map, Value, json};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Completion, Executor, TaskContext, model_name};
use crate::broker::{ProgressSink, STAGE_RUNNING};
use crate::error::ExecError;

const SERVICE: &str = "ollama";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const READ_TIMEOUT: Duration = Duration::from_secs(300);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ModelQueryExecutor {
    client: reqwest::Client,
    base_url: String,
    flush_interval: Duration,
    request_timeout: Duration,
}

impl ModelQueryExecutor {
    pub fn new(base_url: String, flush_interval: Duration) -> Result<Self, ExecError> {
        Self::with_timeouts(base_url, flush_interval, REQUEST_TIMEOUT, READ_TIMEOUT)
    }

    /// `request_timeout` bounds a whole non-streaming exchange. `read_timeout`
    /// bounds the silence between two reads of a response body.
    pub fn with_timeouts(
        base_url: String,
        flush_interval: Duration,
        request_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, ExecError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(read_timeout)
            .build()
            .map_err(|e| api_error(format!("failed to build HTTP client: {e}"), None))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            flush_interval,
            request_timeout,
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    /// `deadline` caps the whole exchange, body included.
    async fn post(
        &self,
        body: &Value,
        deadline: Option<Duration>,
    ) -> Result<reqwest::Response, ExecError> {
        let mut request = self.client.post(self.chat_url()).json(body);
        if let Some(deadline) = deadline {
            request = request.timeout(deadline);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| api_error(e.to_string(), None))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.ok();
            return Err(api_error(format!("server returned {status}"), text));
        }
        Ok(resp)
    }

    async fn query(&self, body: &Value) -> Result<Value, ExecError> {
        let text = self
            .post(body, Some(self.request_timeout))
            .await?
            .text()
            .await
            .map_err(|e| api_error(e.to_string(), None))?;
        serde_json::from_str(&text)
            .map_err(|e| api_error(format!("response is not JSON: {e}"), Some(text)))
    }

    async fn query_streaming(
        &self,
        body: &Value,
        progress: &dyn ProgressSink,
    ) -> Result<Value, ExecError> {
        let resp = self.post(body, None).await?;
        let chunks = futures::stream::unfold(Some(resp), |state| async move {
            let mut resp = state?;
            match resp.chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(resp))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        });
        consume_stream(Box::pin(chunks), self.flush_interval, progress).await
    }
}

fn api_error(reason: String, body: Option<String>) -> ExecError {
    ExecError::Api {
        service: SERVICE.to_string(),
        reason,
        body,
    }
}

/// Chat request for `model`. Returns the body and whether to stream.
fn build_request(model: &str, payload: &Value) -> Result<(Value, bool), ExecError> {
    let mut body = match payload {
        Value::String(prompt) => {
            let mut map = Map::new();
            map.insert(
                "messages".into(),
                json!([{ "role": "user", "content": prompt }]),
            );
            map
        }
        Value::Object(map) => map.clone(),
        _ => {
            return Err(ExecError::InvalidPayload(
                "expected a prompt string or a chat request object".to_string(),
            ));
        }
    };
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    body.insert("model".into(), Value::String(model.to_string()));
    body.insert("stream".into(), Value::Bool(stream));
    Ok((Value::Object(body), stream))
}

/// Accumulated state of one streamed response.
struct StreamState {
    full_text: String,
    pending: String,
    last_flush: Instant,
    final_record: Option<Value>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            full_text: String::new(),
            pending: String::new(),
            last_flush: Instant::now(),
            final_record: None,
        }
    }

    /// Fold one NDJSON line in. Malformed lines are skipped.
    fn ingest(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let record: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "Skipping malformed stream record");
                return;
            }
        };
        let fragment = record
            .pointer("/message/content")
            .or_else(|| record.get("response"))
            .and_then(Value::as_str);
        if let Some(fragment) = fragment {
            self.full_text.push_str(fragment);
            self.pending.push_str(fragment);
        }
        if record.get("done").and_then(Value::as_bool) == Some(true) {
            self.final_record = Some(record);
        }
    }

    /// Text to flush if the interval has elapsed.
    fn take_due(&mut self, interval: Duration) -> Option<String> {
        if self.last_flush.elapsed() < interval {
            return None;
        }
        self.last_flush = Instant::now();
        self.take_pending()
    }

    fn take_pending(&mut self) -> Option<String> {
        (!self.pending.is_empty()).then(|| std::mem::take(&mut self.pending))
    }

    /// Final record with `message.content` replaced by the full text.
    fn into_response(self) -> Option<Value> {
        let mut record = self.final_record?;
        if let Value::Object(map) = &mut record {
            map.insert(
                "message".into(),
                json!({ "role": "assistant", "content": self.full_text }),
            );
        }
        Some(record)
    }
}

/// Drive a chunked NDJSON response to completion, emitting interval flushes.
pub(crate) async fn consume_stream<S, B, E>(
    mut chunks: S,
    flush_interval: Duration,
    progress: &dyn ProgressSink,
) -> Result<Value, ExecError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut state = StreamState::new();
    let mut buf: Vec<u8> = Vec::new();

    while let Some(chunk) = chunks.next().await {
        let chunk =
            chunk.map_err(|e| api_error(e.to_string(), Some(state.full_text.clone())))?;
        buf.extend_from_slice(chunk.as_ref());
        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            state.ingest(&line);
            if let Some(text) = state.take_due(flush_interval) {
                progress.progress(STAGE_RUNNING, &text).await;
            }
            if state.final_record.is_some() {
                break;
            }
        }
        if state.final_record.is_some() {
            break;
        }
    }
    if state.final_record.is_none() && !buf.is_empty() {
        state.ingest(&buf);
    }

    if let Some(text) = state.take_pending() {
        progress.progress(STAGE_RUNNING, &text).await;
    }
    if state.final_record.is_none() {
        warn!("Model stream ended without a final record");
        let partial = std::mem::take(&mut state.full_text);
        return Err(api_error(
            "stream ended before the final record".to_string(),
            Some(partial),
        ));
    }
    state
        .into_response()
        .ok_or_else(|| api_error("stream produced no response".to_string(), None))
}

#[async_trait]
impl Executor for ModelQueryExecutor {
    fn name(&self) -> &str {
        "llm"
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        progress: &dyn ProgressSink,
    ) -> Result<Completion, ExecError> {
        let model = model_name(&ctx.capability)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| {
                ExecError::InvalidPayload(format!(
                    "capability {} does not name a model",
                    ctx.capability
                ))
            })?;
        let (body, stream) = build_request(model, &ctx.payload)?;
        debug!(task_id = %ctx.id, model, stream, "Querying model");

        let output = if stream {
            self.query_streaming(&body, progress).await?
        } else {
            self.query(&body).await?
        };
        Ok(Completion::Success { output })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::progress::testing::RecordingSink;

    #[test]
    fn string_payload_becomes_user_message() {
        let (body, stream) = build_request("llama3", &json!("Why is the sky blue?")).unwrap();
        assert!(!stream);
        assert_eq!(
            body,
            json!({
                "model": "llama3",
                "messages": [{"role": "user", "content": "Why is the sky blue?"}],
                "stream": false,
            })
        );
    }

    #[test]
    fn object_payload_gets_model_and_stream_flag() {
        let (body, stream) = build_request(
            "llama3",
            &json!({"model": "other", "messages": [], "options": {"temperature": 0}}),
        )
        .unwrap();
        assert!(!stream);
        assert_eq!(body["model"], "llama3");
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["temperature"], 0);

        let (body, stream) =
            build_request("llama3", &json!({"messages": [], "stream": true})).unwrap();
        assert!(stream);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn non_text_payload_is_rejected() {
        assert!(build_request("m", &json!([1, 2])).is_err());
    }

    fn token(content: &str) -> String {
        format!(
            "{}\n",
            json!({"model": "m", "message": {"role": "assistant", "content": content}, "done": false})
        )
    }

    fn done() -> String {
        format!(
            "{}\n",
            json!({"model": "m", "message": {"role": "assistant", "content": ""}, "done": true, "done_reason": "stop"})
        )
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_on_interval_over_five_seconds() {
        // One token every 500ms for 5s, then the final record.
        let chunks = futures::stream::unfold(0u32, |n| async move {
            if n > 10 {
                return None;
            }
            if n == 10 {
                return Some((Ok::<_, String>(done()), n + 1));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
            Some((Ok(token(&format!("t{n} "))), n + 1))
        });

        let sink = RecordingSink::default();
        let response = consume_stream(Box::pin(chunks), Duration::from_secs(2), &sink)
            .await
            .unwrap();

        let logs = sink.logs().await;
        assert!((2..=3).contains(&logs.len()), "got {} flushes", logs.len());
        let expected: String = (0..10).map(|n| format!("t{n} ")).collect();
        assert_eq!(logs.concat(), expected);
        assert_eq!(response["message"]["content"], expected);
        assert_eq!(response["done"], true);
        assert_eq!(response["done_reason"], "stop");
    }

    #[tokio::test]
    async fn malformed_and_split_records_are_handled() {
        let first = token("Hello");
        let (a, b) = first.split_at(10);
        let parts = vec![
            Ok::<_, String>(a.to_string()),
            Ok(b.to_string()),
            Ok("{not json}\n".to_string()),
            Ok(token(", world")),
            Ok(done()),
        ];
        let sink = RecordingSink::default();
        let response = consume_stream(
            futures::stream::iter(parts),
            Duration::from_secs(60),
            &sink,
        )
        .await
        .unwrap();

        assert_eq!(response["message"]["content"], "Hello, world");
        // Nothing was due before the end, so the remainder is one flush.
        assert_eq!(sink.logs().await, vec!["Hello, world".to_string()]);
    }

    #[tokio::test]
    async fn stream_without_final_record_fails() {
        let parts = vec![Ok::<_, String>(token("partial"))];
        let sink = RecordingSink::default();
        let err = consume_stream(futures::stream::iter(parts), Duration::from_secs(60), &sink)
            .await
            .unwrap_err();
        match err {
            ExecError::Api { body, .. } => assert_eq!(body.as_deref(), Some("partial")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sink.logs().await, vec!["partial".to_string()]);
    }

    #[tokio::test]
    async fn transport_error_mid_stream_fails() {
        let parts = vec![Ok(token("a")), Err("connection reset".to_string())];
        let err = consume_stream(
            futures::stream::iter(parts),
            Duration::from_secs(60),
            &crate::broker::NoProgress,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        match err {
            ExecError::Api { body, .. } => assert_eq!(body.as_deref(), Some("a")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
