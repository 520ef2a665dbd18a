//! Local Ollama service helpers: health probe, auto-start, model discovery.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::exec::MODEL_PREFIX;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const START_ATTEMPTS: u32 = 5;
const START_POLL: Duration = Duration::from_secs(1);

/// Healthy iff the root answers 200 with the service banner.
pub async fn is_running(base_url: &str) -> bool {
    let client = reqwest::Client::new();
    let Ok(resp) = client.get(base_url).timeout(PROBE_TIMEOUT).send().await else {
        return false;
    };
    if resp.status() != reqwest::StatusCode::OK {
        return false;
    }
    resp.text()
        .await
        .map(|body| body.contains("Ollama is running"))
        .unwrap_or(false)
}

/// Start `ollama serve` if the service is not answering. Returns whether it is
/// up afterwards; never fatal.
pub async fn ensure_running(base_url: &str) -> bool {
    if is_running(base_url).await {
        return true;
    }
    info!("Ollama not answering, starting 'ollama serve'");
    let spawned = Command::new("ollama")
        .arg("serve")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    if let Err(e) = spawned {
        warn!(error = %e, "Could not start Ollama; is it installed and in PATH?");
        return false;
    }
    for _ in 0..START_ATTEMPTS {
        tokio::time::sleep(START_POLL).await;
        if is_running(base_url).await {
            info!("Ollama started");
            return true;
        }
    }
    warn!("Ollama did not come up after 'ollama serve'");
    false
}

/// `LLM::<model>` capabilities for every locally installed model.
pub async fn model_capabilities() -> Vec<String> {
    match Command::new("ollama").arg("list").output().await {
        Ok(out) if out.status.success() => parse_list(&String::from_utf8_lossy(&out.stdout)),
        Ok(out) => {
            warn!(
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "'ollama list' failed; no model capabilities added"
            );
            Vec::new()
        }
        Err(e) => {
            warn!(error = %e, "Ollama is not installed; no model capabilities added");
            Vec::new()
        }
    }
}

/// Parse `ollama list` output: skip the header, first column, drop `:latest`.
fn parse_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(|name| name.strip_suffix(":latest").unwrap_or(name))
        .map(|name| format!("{MODEL_PREFIX}{name}"))
        .collect()
}
