//! Executors: the components that run a claimed, prepared task.
//!
//! An executor returns exactly one [`Completion`] (or an [`ExecError`], which
//! the engine turns into a failure) and may stream progress through a
//! [`ProgressSink`] while it runs. Submitting the terminal report is the
//! engine's job.

pub mod echo;
pub mod llm;
pub mod registry;
pub mod shell;
pub mod tts;

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

use crate::broker::ProgressSink;
use crate::broker::protocol::TaskId;
use crate::error::ExecError;

pub use registry::{Builtin, ExecutorRegistry, MODEL_PREFIX, model_name};

/// Everything an executor gets to see about its task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: TaskId,
    pub capability: String,
    pub payload: Value,
    pub workdir: PathBuf,
}

/// Terminal outcome produced by an executor.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Success { output: Value },
    Failure { message: String, output: Value },
}

impl Completion {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn output(&self) -> &Value {
        match self {
            Self::Success { output } | Self::Failure { output, .. } => output,
        }
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn execute(
        &self,
        ctx: &TaskContext,
        progress: &dyn ProgressSink,
    ) -> Result<Completion, ExecError>;
}

/// Shell command from a payload: a bare string, or `{"command": "..."}`.
pub(crate) fn command_from_payload(payload: &Value) -> Option<&str> {
    let command = match payload {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get("command").and_then(Value::as_str),
        _ => None,
    };
    command.filter(|c| !c.trim().is_empty())
}
