//! Task lifecycle engine: poll → claim → prepare → execute → report.
//!
//! One task at a time. Every claimed task ends with exactly one terminal
//! report, submitted here and nowhere else; executors only produce the
//! [`Completion`] and stream progress.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, BrokerProgress, ProgressSink, ResultReport, Task, TaskId, TaskStatus};
use crate::config::EngineConfig;
use crate::error::{ExecError, FetchError};
use crate::exec::{Completion, Executor, ExecutorRegistry, TaskContext};
use crate::fetch::FileFetcher;
use crate::workdir;

/// Outcome of one loop iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum Cycle {
    /// Broker had no work.
    Idle,
    /// Long-poll timed out; retried without backoff.
    PollTimedOut,
    /// Poll failed for another reason; backoff applies.
    PollFailed,
    /// Pointer could not be claimed; the cycle was abandoned.
    ClaimFailed(TaskId),
    /// Task ran to a terminal report. `delivered` is false when the broker
    /// did not accept it.
    Reported { report: ResultReport, delivered: bool },
}

pub struct TaskEngine {
    client: BrokerClient,
    registry: Arc<ExecutorRegistry>,
    fetcher: FileFetcher,
    cfg: EngineConfig,
}

impl TaskEngine {
    pub fn new(
        client: BrokerClient,
        registry: ExecutorRegistry,
        cfg: EngineConfig,
    ) -> Result<Self, FetchError> {
        Ok(Self {
            client,
            registry: Arc::new(registry),
            fetcher: FileFetcher::new(cfg.verify_tls)?,
            cfg,
        })
    }

    /// Run cycles forever.
    pub async fn run(&self) {
        info!(
            broker = self.client.base(),
            runs_dir = %self.cfg.runs_dir().display(),
            "Task loop started"
        );
        loop {
            let cycle = self.run_once().await;
            tokio::time::sleep(delay_after(&cycle, &self.cfg)).await;
        }
    }

    /// One poll-claim-prepare-execute-report iteration, without the loop delay.
    pub async fn run_once(&self) -> Cycle {
        let pointer = match self.client.poll(self.cfg.poll_timeout).await {
            Ok(Some(pointer)) => pointer,
            Ok(None) => {
                debug!("No task available");
                return Cycle::Idle;
            }
            Err(e) if e.is_timeout() => {
                debug!("Poll timed out");
                return Cycle::PollTimedOut;
            }
            Err(e) => {
                error!(error = %e, "Poll failed");
                return Cycle::PollFailed;
            }
        };

        info!(task_id = %pointer, "Claiming task");
        let task = match self.client.claim(&pointer, self.cfg.claim_timeout).await {
            Ok(task) => task,
            Err(e) => {
                warn!(task_id = %pointer, error = %e, "Failed to claim task");
                return Cycle::ClaimFailed(pointer);
            }
        };

        let report = self.process(task).await;
        let delivered = self.submit(&report).await;
        Cycle::Reported { report, delivered }
    }

    /// Prepare and execute a claimed task, producing its terminal report.
    pub async fn process(&self, task: Task) -> ResultReport {
        let started = Instant::now();
        let capability = task.capability().to_string();

        let Some(executor) = self.registry.resolve(&capability) else {
            warn!(task_id = %task.id, capability = %capability, "No executor for capability");
            let message = format!("Unknown capability: {capability}");
            return ResultReport {
                id: task.id,
                status: TaskStatus::failure(&message, started.elapsed()),
                output: json!({ "error": message }),
                capability,
            };
        };

        let workdir = match self.prepare(&task).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Task preparation failed");
                return ResultReport {
                    id: task.id,
                    status: TaskStatus::failure(e.to_string(), started.elapsed()),
                    output: json!({ "error": e.to_string() }),
                    capability,
                };
            }
        };

        info!(
            task_id = %task.id,
            executor = executor.name(),
            workdir = %workdir.display(),
            "Executing task"
        );
        let ctx = TaskContext {
            id: task.id.clone(),
            capability: capability.clone(),
            payload: task.data.payload,
            workdir,
        };
        let completion = self.execute(executor, ctx).await;

        let elapsed = started.elapsed();
        let (status, output) = match completion {
            Completion::Success { output } => (TaskStatus::success(elapsed), output),
            Completion::Failure { message, output } => {
                (TaskStatus::failure(message, elapsed), output)
            }
        };
        info!(
            task_id = %task.id,
            success = status.is_success(),
            elapsed_secs = elapsed.as_secs_f64(),
            "Task finished"
        );
        ResultReport {
            id: task.id,
            status,
            output,
            capability,
        }
    }

    async fn prepare(&self, task: &Task) -> Result<PathBuf, FetchError> {
        let dir = workdir::create(&self.cfg.runs_dir(), &task.id.id).await?;
        if !task.data.fetch_files.is_empty() {
            debug!(task_id = %task.id, files = task.data.fetch_files.len(), "Acquiring files");
            self.fetcher.prepare(&dir, &task.data.fetch_files).await?;
        }
        Ok(dir)
    }

    /// Run the executor on its own task so a panic becomes a failure.
    async fn execute(&self, executor: Arc<dyn Executor>, ctx: TaskContext) -> Completion {
        let progress: Arc<dyn ProgressSink> = Arc::new(BrokerProgress::new(
            self.client.clone(),
            ctx.id.clone(),
            self.cfg.progress_timeout,
        ));
        let id = ctx.id.clone();
        let handle =
            tokio::spawn(async move { executor.execute(&ctx, progress.as_ref()).await });

        let err = match handle.await {
            Ok(Ok(completion)) => return completion,
            Ok(Err(e)) => e,
            Err(join) => ExecError::Panicked(join.to_string()),
        };
        warn!(task_id = %id, error = %err, "Executor failed");
        Completion::Failure {
            message: err.to_string(),
            output: err.to_output(),
        }
    }

    /// Send the terminal report once. Failures are logged, not retried.
    async fn submit(&self, report: &ResultReport) -> bool {
        match self
            .client
            .report_result(report, self.cfg.report_timeout)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(task_id = %report.id, error = %e, "Failed to submit task result");
                false
            }
        }
    }
}

/// Delay between cycles after the given outcome.
pub fn delay_after(cycle: &Cycle, cfg: &EngineConfig) -> Duration {
    match cycle {
        Cycle::PollFailed => cfg.error_backoff + cfg.loop_delay,
        _ => cfg.loop_delay,
    }
}
