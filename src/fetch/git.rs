//! `git clone` into a task's working directory.
//!
//! Credentials come from the ambient environment (SSH agent, credential
//! helper); nothing is injected into the URL.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::info;

use crate::error::FetchError;

pub async fn clone(url: &str, target: &Path) -> Result<(), FetchError> {
    let output = Command::new("git")
        .arg("clone")
        .arg("--")
        .arg(url)
        .arg(target)
        // Fail instead of blocking on an interactive credential prompt.
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| FetchError::GitClone {
            url: url.to_string(),
            reason: if e.kind() == std::io::ErrorKind::NotFound {
                "git is not installed or not in PATH".to_string()
            } else {
                e.to_string()
            },
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(FetchError::GitClone {
            url: url.to_string(),
            reason: if stderr.is_empty() {
                format!("git exited with {}", output.status)
            } else {
                stderr
            },
        });
    }

    info!(url, path = %target.display(), "Cloned repository");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clone_of_missing_repo_fails_with_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("no-such-repo");
        let target = tmp.path().join("checkout");

        let err = clone(missing.to_str().unwrap(), &target).await.unwrap_err();
        match err {
            FetchError::GitClone { reason, .. } => assert!(!reason.is_empty()),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!target.exists());
    }
}
