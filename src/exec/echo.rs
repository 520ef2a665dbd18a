//! `debug::echo`: succeeds with the payload as output.

use async_trait::async_trait;

use super::{Completion, Executor, TaskContext};
use crate::broker::ProgressSink;
use crate::error::ExecError;

pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        _progress: &dyn ProgressSink,
    ) -> Result<Completion, ExecError> {
        Ok(Completion::Success {
            output: ctx.payload.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::NoProgress;
    use crate::broker::protocol::TaskId;
    use serde_json::json;

    #[tokio::test]
    async fn echoes_payload() {
        let ctx = TaskContext {
            id: TaskId::new("e1", "debug::echo"),
            capability: "debug::echo".into(),
            payload: json!({"a": [1, 2, 3]}),
            workdir: std::env::temp_dir(),
        };
        let result = EchoExecutor.execute(&ctx, &NoProgress).await.unwrap();
        assert_eq!(
            result,
            Completion::Success {
                output: json!({"a": [1, 2, 3]})
            }
        );
    }
}
