//! Error types for the offload agent.

use std::path::PathBuf;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("File acquisition error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors talking to the broker (or any other HTTP peer through the transport).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Request to {url} timed out")]
    Timeout { url: String },

    #[error("Request to {url} failed: {reason}")]
    RequestFailed { url: String, reason: String },

    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },
}

impl TransportError {
    /// Classify a reqwest error, keeping timeouts distinct.
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else {
            Self::RequestFailed {
                url: url.to_string(),
                reason: err.to_string(),
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// File acquisition errors. Any of these is fatal to the task being prepared.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Path escapes working directory: {0}")]
    PathEscapes(String),

    #[error("File reference {path} has no acquisition method")]
    NoMethod { path: String },

    #[error("git clone of {url} failed: {reason}")]
    GitClone { url: String, reason: String },

    #[error("Invalid object-store locator {locator}: {reason}")]
    InvalidLocator { locator: String, reason: String },

    #[error("Object-store download of {locator} failed: {reason}")]
    ObjectStore { locator: String, reason: String },

    #[error("HTTP download of {url} failed: {reason}")]
    Http { url: String, reason: String },

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Executor errors. The engine turns every one of these into a `failure` report.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Process I/O failed: {0}")]
    ProcessIo(#[source] std::io::Error),

    #[error("{service} request failed: {reason}")]
    Api {
        service: String,
        reason: String,
        /// Raw response body, kept for diagnostics.
        body: Option<String>,
    },

    #[error("Executor panicked: {0}")]
    Panicked(String),
}

impl ExecError {
    /// Output document attached to the failure report for this error.
    pub fn to_output(&self) -> serde_json::Value {
        match self {
            Self::Api {
                body: Some(body), ..
            } => serde_json::json!({
                "error": self.to_string(),
                "response_text": body,
            }),
            Self::Api { body: None, .. } => serde_json::json!({
                "error": self.to_string(),
                "response_text": "No response from server",
            }),
            _ => serde_json::json!({ "error": self.to_string() }),
        }
    }
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
