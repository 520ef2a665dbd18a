//! Model query executor against a mock Ollama `/api/chat`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::time::timeout;

use common::{TEST_TIMEOUT, serve};
use offload_agent::broker::{ProgressSink, TaskId};
use offload_agent::error::ExecError;
use offload_agent::exec::llm::ModelQueryExecutor;
use offload_agent::exec::{Completion, Executor, TaskContext};

#[derive(Default)]
struct Recorder {
    logs: Mutex<Vec<String>>,
}

#[async_trait]
impl ProgressSink for Recorder {
    async fn progress(&self, _stage: &str, log: &str) {
        self.logs.lock().await.push(log.to_string());
    }
}

const TOKENS: usize = 10;
const TOKEN_GAP: Duration = Duration::from_millis(100);

/// Streams `TOKENS` records `TOKEN_GAP` apart when asked to stream;
/// otherwise answers in one body. Model `missing` is a 404.
async fn chat(axum::Json(body): axum::Json<Value>) -> Response {
    let model = body["model"].as_str().unwrap_or_default().to_string();
    if model == "missing" {
        return (StatusCode::NOT_FOUND, r#"{"error":"model 'missing' not found"}"#).into_response();
    }
    if body["stream"] != true {
        let prompt = body["messages"][0]["content"].as_str().unwrap_or_default();
        return axum::Json(json!({
            "model": model,
            "message": {"role": "assistant", "content": format!("echo: {prompt}")},
            "done": true,
        }))
        .into_response();
    }

    let stream = futures::stream::unfold(0usize, move |n| {
        let model = model.clone();
        async move {
            if n > TOKENS {
                return None;
            }
            let record = if n == TOKENS {
                json!({"model": model, "message": {"role": "assistant", "content": ""}, "done": true, "eval_count": TOKENS})
            } else {
                tokio::time::sleep(TOKEN_GAP).await;
                json!({"model": model, "message": {"role": "assistant", "content": format!("{n} ")}, "done": false})
            };
            Some((Ok::<_, std::io::Error>(format!("{record}\n")), n + 1))
        }
    });
    Response::builder()
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn start_ollama() -> String {
    serve(Router::new().route("/api/chat", post(chat))).await
}

fn ctx(capability: &str, payload: Value) -> TaskContext {
    TaskContext {
        id: TaskId::new("q1", capability),
        capability: capability.to_string(),
        payload,
        workdir: std::env::temp_dir(),
    }
}

#[tokio::test]
async fn prompt_string_is_answered_in_one_response() {
    timeout(TEST_TIMEOUT, async {
        let url = start_ollama().await;
        let executor = ModelQueryExecutor::new(url, Duration::from_secs(2)).unwrap();
        let recorder = Recorder::default();

        let result = executor
            .execute(&ctx("LLM::llama3", json!("hello")), &recorder)
            .await
            .unwrap();

        match result {
            Completion::Success { output } => {
                assert_eq!(output["model"], "llama3");
                assert_eq!(output["message"]["content"], "echo: hello");
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert!(recorder.logs.lock().await.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn streaming_flushes_on_interval() {
    timeout(TEST_TIMEOUT, async {
        let url = start_ollama().await;
        // ~1s of tokens with a 400ms flush interval: two timed flushes plus
        // the remainder.
        let executor = ModelQueryExecutor::new(url, Duration::from_millis(400)).unwrap();
        let recorder = Arc::new(Recorder::default());

        let result = executor
            .execute(
                &ctx(
                    "LLM::llama3",
                    json!({"messages": [{"role": "user", "content": "count"}], "stream": true}),
                ),
                recorder.as_ref(),
            )
            .await
            .unwrap();

        let expected: String = (0..TOKENS).map(|n| format!("{n} ")).collect();
        let output = result.output().clone();
        assert_eq!(output["message"]["content"], expected);
        assert_eq!(output["done"], true);
        assert_eq!(output["eval_count"], TOKENS);

        let logs = recorder.logs.lock().await.clone();
        assert!((2..=4).contains(&logs.len()), "got {} flushes", logs.len());
        assert_eq!(logs.concat(), expected);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn service_error_keeps_response_body() {
    timeout(TEST_TIMEOUT, async {
        let url = start_ollama().await;
        let executor = ModelQueryExecutor::new(url, Duration::from_secs(2)).unwrap();

        let err = executor
            .execute(&ctx("LLM::missing", json!("hi")), &Recorder::default())
            .await
            .unwrap_err();

        match &err {
            ExecError::Api { body, .. } => {
                assert!(body.as_deref().unwrap().contains("not found"));
            }
            other => panic!("unexpected error: {other}"),
        }
        let output = err.to_output();
        assert!(output["response_text"].as_str().unwrap().contains("not found"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unreachable_service_is_an_api_error() {
    let executor =
        ModelQueryExecutor::new("http://127.0.0.1:9".into(), Duration::from_secs(2)).unwrap();
    let err = executor
        .execute(&ctx("LLM::llama3", json!("hi")), &Recorder::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::Api { body: None, .. }));
}

#[tokio::test]
async fn stream_outlasting_request_deadline_completes() {
    timeout(TEST_TIMEOUT, async {
        let url = start_ollama().await;
        // ~1s of tokens against a 300ms whole-request deadline; only the
        // gap between reads is bounded while streaming.
        let executor = ModelQueryExecutor::with_timeouts(
            url,
            Duration::from_secs(2),
            Duration::from_millis(300),
            Duration::from_secs(2),
        )
        .unwrap();

        let result = executor
            .execute(
                &ctx(
                    "LLM::llama3",
                    json!({"messages": [{"role": "user", "content": "count"}], "stream": true}),
                ),
                &Recorder::default(),
            )
            .await
            .unwrap();

        let expected: String = (0..TOKENS).map(|n| format!("{n} ")).collect();
        assert!(result.is_success());
        assert_eq!(result.output()["message"]["content"], expected);
    })
    .await
    .expect("test timed out");
}
