//! Progress updates for in-flight tasks.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::client::BrokerClient;
use super::protocol::{ProgressReport, TaskId};

/// Stage label attached to every streamed output fragment.
pub const STAGE_RUNNING: &str = "running";

/// Destination for non-terminal progress updates.
///
/// Delivery is best-effort: implementations log failures and never surface
/// them to the executor, so a dropped update cannot change a task's outcome.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn progress(&self, stage: &str, log: &str);
}

/// Sink that posts updates for one task to the broker.
pub struct BrokerProgress {
    client: BrokerClient,
    id: TaskId,
    timeout: Duration,
}

impl BrokerProgress {
    pub fn new(client: BrokerClient, id: TaskId, timeout: Duration) -> Self {
        Self {
            client,
            id,
            timeout,
        }
    }
}

#[async_trait]
impl ProgressSink for BrokerProgress {
    async fn progress(&self, stage: &str, log: &str) {
        let report = ProgressReport {
            id: self.id.clone(),
            stage: stage.to_string(),
            log_update: log.to_string(),
        };
        if let Err(e) = self.client.report_progress(&report, self.timeout).await {
            warn!(task_id = %self.id, error = %e, "Failed to send progress update");
        }
    }
}

/// Sink that discards everything.
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn progress(&self, _stage: &str, _log: &str) {}
}
