//! Per-task scratch directories.
//!
//! Each task gets `<data_dir>/runs/<task id>/`. Directories are created before
//! file acquisition and never removed by the agent.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::broker::protocol::encode_segment;
use crate::error::FetchError;

/// Directory name for a task id. Ids are opaque, so they are percent-encoded
/// to keep separators and dot-only names from escaping `runs/`.
pub fn dir_name(task_id: &str) -> String {
    let encoded = encode_segment(task_id);
    if encoded.is_empty() {
        "%00".to_string()
    } else if encoded.chars().all(|c| c == '.') {
        encoded.replace('.', "%2E")
    } else {
        encoded
    }
}

/// Create (if needed) and return the working directory for a task.
pub async fn create(runs_dir: &Path, task_id: &str) -> Result<PathBuf, FetchError> {
    let dir = runs_dir.join(dir_name(task_id));
    fs::create_dir_all(&dir)
        .await
        .map_err(|e| FetchError::io(&dir, e))?;
    Ok(dir)
}
