//! Configuration types.
//!
//! Two kinds of configuration live here:
//! - [`AgentConfig`]: the persisted registration record (`.offload-client.json`).
//!   Loaded once at startup, mutated in memory, saved explicitly.
//! - [`EngineConfig`]: timings and toggles for the task loop, with defaults
//!   and environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

/// Default location of the persisted agent record, relative to the cwd.
pub const CONFIG_FILE: &str = ".offload-client.json";

/// Persisted agent registration and credentials.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expires_in: Option<u64>,
    /// Keys written by other tools are preserved across load/save.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("server", &self.server)
            .field("agent_id", &self.agent_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "[redacted]"))
            .field("key", &self.key.as_ref().map(|_| "[redacted]"))
            .field("jwt_token", &self.jwt_token.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

impl AgentConfig {
    /// Load from `path`. A missing file yields an empty config; an unreadable
    /// or corrupt one is reported and also yields an empty config.
    pub fn load(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read config file");
                return Self::default();
            }
        };
        match serde_json::from_str(&text) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not parse config file");
                Self::default()
            }
        }
    }

    /// Write to `path` as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Server URL, preferring an explicit override.
    pub fn resolve_server(&self, explicit: Option<&str>) -> Result<String, ConfigError> {
        explicit
            .map(str::to_string)
            .or_else(|| self.server.clone())
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "server".to_string(),
                hint: "Pass --server or store it in the config file.".to_string(),
            })
    }

    /// Registered agent id and key, required before serving.
    pub fn credentials(&self) -> Result<(String, SecretString), ConfigError> {
        match (&self.agent_id, &self.key) {
            (Some(id), Some(key)) => Ok((id.clone(), SecretString::from(key.clone()))),
            _ => Err(ConfigError::MissingRequired {
                key: "agentId/key".to_string(),
                hint: "Agent not registered or config incomplete. Run 'register' first."
                    .to_string(),
            }),
        }
    }
}

/// Task-loop timings and toggles.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long the broker may hold a poll open.
    pub poll_timeout: Duration,
    pub claim_timeout: Duration,
    pub report_timeout: Duration,
    pub progress_timeout: Duration,
    /// Delay after every loop iteration, whatever the outcome.
    pub loop_delay: Duration,
    /// Extra delay after a non-timeout poll failure.
    pub error_backoff: Duration,
    /// Per-install data directory; task working dirs live under `runs/`.
    pub data_dir: PathBuf,
    /// Verify TLS certificates for HTTP file downloads. Off by default so
    /// self-signed internal endpoints work; this trades away MITM protection
    /// for those downloads.
    pub verify_tls: bool,
    /// Base URL of the local model service.
    pub ollama_url: String,
    /// How often streamed model output is flushed as a progress update.
    pub llm_flush_interval: Duration,
    /// Speech synthesis endpoint and optional bearer key.
    pub tts_url: String,
    pub tts_api_key: Option<SecretString>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(60),
            claim_timeout: Duration::from_secs(60),
            report_timeout: Duration::from_secs(300),
            progress_timeout: Duration::from_secs(300),
            loop_delay: Duration::from_secs(5),
            error_backoff: Duration::from_secs(15),
            data_dir: default_data_dir(),
            verify_tls: false,
            ollama_url: "http://127.0.0.1:11434".to_string(),
            llm_flush_interval: Duration::from_secs(2),
            tts_url: "http://127.0.0.1:4069/api/v1/audio/speech".to_string(),
            tts_api_key: None,
        }
    }
}

impl EngineConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Ok(dir) = std::env::var("OFFLOAD_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Ok(raw) = std::env::var("OFFLOAD_VERIFY_TLS") {
            cfg.verify_tls = parse_bool("OFFLOAD_VERIFY_TLS", &raw)?;
        }
        if let Ok(host) = std::env::var("OLLAMA_HOST") {
            cfg.ollama_url = normalize_ollama_host(&host);
        }
        if let Ok(url) = std::env::var("KOKORO_API_URL") {
            cfg.tts_url = url;
        }
        if let Ok(key) = std::env::var("KOKORO_API_KEY") {
            if !key.is_empty() {
                cfg.tts_api_key = Some(SecretString::from(key));
            }
        }
        if let Ok(raw) = std::env::var("OFFLOAD_LOOP_DELAY_SECS") {
            cfg.loop_delay = Duration::from_secs(parse_secs("OFFLOAD_LOOP_DELAY_SECS", &raw)?);
        }
        if let Ok(raw) = std::env::var("OFFLOAD_POLL_TIMEOUT_SECS") {
            cfg.poll_timeout =
                Duration::from_secs(parse_secs("OFFLOAD_POLL_TIMEOUT_SECS", &raw)?);
        }

        Ok(cfg)
    }

    /// Directory under which per-task working directories are created.
    pub fn runs_dir(&self) -> PathBuf {
        self.data_dir.join("runs")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("offload_client")
}

/// `OLLAMA_HOST` may be a bare `host:port`.
fn normalize_ollama_host(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}

fn parse_secs(key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected whole seconds, got '{raw}'"),
    })
}
