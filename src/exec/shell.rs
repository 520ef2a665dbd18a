//! Shell command execution.
//!
//! Two modes:
//! - streaming (`shell::bash`): stdout and stderr are drained concurrently by
//!   two reader tasks into unbounded queues, and a coordinating loop forwards
//!   every line as a progress update while accumulating the full logs.
//! - buffered (`shellcmd::bash`): run to completion, read output afterwards.
//!
//! Both classify by exit code: `0` is success, anything else is failure with
//! the return code in the output.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Completion, Executor, TaskContext, command_from_payload};
use crate::broker::{ProgressSink, STAGE_RUNNING};
use crate::error::ExecError;

const NO_COMMAND: &str = "No 'command' provided in payload.";

/// How often the coordinating loop checks the output queues.
const DRAIN_INTERVAL: Duration = Duration::from_millis(100);

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the process was terminated by a signal.
    pub code: i32,
}

impl ProcessOutput {
    /// Map an exit code onto a terminal outcome.
    pub fn classify(self) -> Completion {
        if self.code == 0 {
            return Completion::Success {
                output: json!({ "stdout": self.stdout, "stderr": self.stderr }),
            };
        }
        let message = if self.stderr.is_empty() {
            format!("Command failed with exit code {}", self.code)
        } else {
            self.stderr.clone()
        };
        Completion::Failure {
            message,
            output: json!({
                "stdout": self.stdout,
                "stderr": self.stderr,
                "returnCode": self.code,
            }),
        }
    }
}

fn shell_command(cmd: &str, workdir: &Path) -> Command {
    let mut command = if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", cmd]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", cmd]);
        c
    };
    command
        .current_dir(workdir)
        .kill_on_drop(true)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command
}

/// Read `reader` line by line (newlines kept) into `tx` until EOF.
fn spawn_reader<R>(reader: R, tx: UnboundedSender<String>) -> JoinHandle<std::io::Result<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                return Ok(());
            }
            if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                return Ok(());
            }
        }
    })
}

/// Move every queued line into `log`, emitting one progress update per line.
/// Returns `false` once the queue is closed and empty.
async fn drain(
    rx: &mut UnboundedReceiver<String>,
    log: &mut String,
    progress: &dyn ProgressSink,
) -> bool {
    loop {
        match rx.try_recv() {
            Ok(line) => {
                log.push_str(&line);
                progress.progress(STAGE_RUNNING, &line).await;
            }
            Err(TryRecvError::Empty) => return true,
            Err(TryRecvError::Disconnected) => return false,
        }
    }
}

async fn join_reader(handle: JoinHandle<std::io::Result<()>>) -> Result<(), ExecError> {
    match handle.await {
        Ok(result) => result.map_err(ExecError::ProcessIo),
        Err(e) => Err(ExecError::Panicked(e.to_string())),
    }
}

/// Run `cmd` in `workdir`, streaming each output line to `progress`.
pub async fn run_streaming(
    cmd: &str,
    workdir: &Path,
    progress: &dyn ProgressSink,
) -> Result<ProcessOutput, ExecError> {
    let mut child = shell_command(cmd, workdir)
        .spawn()
        .map_err(ExecError::Spawn)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::ProcessIo(std::io::Error::other("stdout not captured")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::ProcessIo(std::io::Error::other("stderr not captured")))?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    let out_reader = spawn_reader(stdout, out_tx);
    let err_reader = spawn_reader(stderr, err_tx);

    let mut full_stdout = String::new();
    let mut full_stderr = String::new();
    let mut status = None;
    let mut tick = tokio::time::interval(DRAIN_INTERVAL);

    loop {
        tick.tick().await;
        let out_open = drain(&mut out_rx, &mut full_stdout, progress).await;
        let err_open = drain(&mut err_rx, &mut full_stderr, progress).await;
        if status.is_none() {
            status = match child.try_wait() {
                Ok(status) => status,
                Err(e) => {
                    out_reader.abort();
                    err_reader.abort();
                    return Err(ExecError::ProcessIo(e));
                }
            };
        }
        if status.is_some() && !out_open && !err_open {
            break;
        }
    }

    join_reader(out_reader).await?;
    join_reader(err_reader).await?;

    let code = status.and_then(|s| s.code()).unwrap_or(-1);
    debug!(code, "Process exited");
    Ok(ProcessOutput {
        stdout: full_stdout,
        stderr: full_stderr,
        code,
    })
}

/// Run `cmd` in `workdir` to completion and return its buffered output.
pub async fn run_buffered(cmd: &str, workdir: &Path) -> Result<ProcessOutput, ExecError> {
    let output = shell_command(cmd, workdir)
        .output()
        .await
        .map_err(ExecError::Spawn)?;
    Ok(ProcessOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        code: output.status.code().unwrap_or(-1),
    })
}

/// Executor for shell capabilities.
#[derive(Debug, Clone, Copy)]
pub struct ShellExecutor {
    streaming: bool,
}

impl ShellExecutor {
    /// Line-by-line progress while the command runs.
    pub fn streaming() -> Self {
        Self { streaming: true }
    }

    /// No intermediate progress.
    pub fn buffered() -> Self {
        Self { streaming: false }
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn name(&self) -> &str {
        if self.streaming { "shell" } else { "shellcmd" }
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        progress: &dyn ProgressSink,
    ) -> Result<Completion, ExecError> {
        let Some(command) = command_from_payload(&ctx.payload) else {
            return Ok(Completion::Failure {
                message: NO_COMMAND.to_string(),
                output: json!({ "error": NO_COMMAND }),
            });
        };
        debug!(task_id = %ctx.id, command, "Running shell command");

        let output = if self.streaming {
            run_streaming(command, &ctx.workdir, progress).await?
        } else {
            run_buffered(command, &ctx.workdir).await?
        };
        Ok(output.classify())
    }
}
