//! WebSocket side channel to the broker.
//!
//! Receives connection notices and heartbeats. Runs beside the task loop and
//! never affects task outcomes; drops are retried after a fixed delay.

use std::time::Duration;

use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, TransportError};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// `ws(s)://host/private/agent/ws?token=...` for a broker base URL.
pub fn ws_url(server: &str, token: &SecretString) -> Result<String, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "server".to_string(),
        message,
    };
    let mut url = url::Url::parse(server).map_err(|e| invalid(e.to_string()))?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|()| invalid(format!("cannot use {server} as a websocket endpoint")))?;
    url.set_path("/private/agent/ws");
    url.set_query(None);
    url.query_pairs_mut()
        .append_pair("token", token.expose_secret());
    Ok(url.into())
}

/// URL with the query (and so the token) removed, for logs.
fn redact(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

/// A decoded side-channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected {
        agent_id: Option<String>,
        message: Option<String>,
    },
    Heartbeat {
        counter: u64,
        timestamp: String,
    },
    Other(Value),
    NonJson(String),
}

impl Event {
    pub fn parse(text: &str) -> Self {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return Self::NonJson(text.to_string());
        };
        let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);
        match value.get("type").and_then(Value::as_str) {
            Some("connected") => Self::Connected {
                agent_id: field("agent_id"),
                message: field("message"),
            },
            Some("heartbeat") => Self::Heartbeat {
                counter: value.get("counter").and_then(Value::as_u64).unwrap_or(0),
                timestamp: field("timestamp").unwrap_or_default(),
            },
            _ => Self::Other(value),
        }
    }

    fn log(&self) {
        match self {
            Self::Connected { agent_id, message } => info!(
                agent_id = agent_id.as_deref().unwrap_or("?"),
                message = message.as_deref().unwrap_or(""),
                "Side channel connected"
            ),
            Self::Heartbeat { counter, timestamp } => {
                debug!(counter, timestamp = %timestamp, "Heartbeat")
            }
            Self::Other(value) => info!(message = %value, "Side channel message"),
            Self::NonJson(text) => warn!(message = %text, "Non-JSON side channel message"),
        }
    }
}

pub struct SideChannel {
    url: String,
    reconnect_delay: Duration,
}

impl SideChannel {
    pub fn new(server: &str, token: &SecretString) -> Result<Self, ConfigError> {
        Ok(Self {
            url: ws_url(server, token)?,
            reconnect_delay: RECONNECT_DELAY,
        })
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Supervise the connection on a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Connect, read until the connection drops, wait, repeat.
    pub async fn run(&self) {
        loop {
            match self.session(|_| {}).await {
                Ok(count) => info!(messages = count, "Side channel closed"),
                Err(e) => error!(error = %e, "Side channel error"),
            }
            info!(delay_secs = self.reconnect_delay.as_secs(), "Reconnecting side channel");
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    /// One connection lifetime. Returns the number of messages handled.
    /// Pings are answered by the protocol layer while reading.
    pub async fn session<F>(&self, mut on_event: F) -> Result<usize, TransportError>
    where
        F: FnMut(&Event),
    {
        let endpoint = redact(&self.url).to_string();
        info!(url = %endpoint, "Connecting side channel");
        let (mut stream, _) =
            connect_async(self.url.as_str())
                .await
                .map_err(|e| TransportError::RequestFailed {
                    url: endpoint.clone(),
                    reason: e.to_string(),
                })?;

        let mut count = 0;
        while let Some(msg) = stream.next().await {
            let msg = msg.map_err(|e| TransportError::RequestFailed {
                url: endpoint.clone(),
                reason: e.to_string(),
            })?;
            let event = match msg {
                Message::Text(text) => Event::parse(text.as_str()),
                Message::Close(frame) => {
                    debug!(?frame, "Close frame received");
                    break;
                }
                _ => continue,
            };
            event.log();
            on_event(&event);
            count += 1;
        }
        Ok(count)
    }
}
