//! Agent registration and authentication against the broker.
//!
//! Both flows update the in-memory [`AgentConfig`]; persisting it is left to
//! the caller.

use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::broker::{BrokerClient, RegistrationRequest};
use crate::config::AgentConfig;
use crate::error::Result;
use crate::sysinfo;

/// Parameters for `POST /agent/register`.
pub struct Registration {
    pub server: String,
    pub api_key: SecretString,
    pub capabilities: Vec<String>,
    pub tier: u8,
    pub capacity: u32,
}

/// Register a new agent, then authenticate it. Returns an authenticated client.
pub async fn register(reg: Registration, config: &mut AgentConfig) -> Result<BrokerClient> {
    let client = BrokerClient::new(reg.server.clone());
    let request = RegistrationRequest {
        capabilities: reg.capabilities,
        tier: reg.tier,
        capacity: reg.capacity,
        system_info: sysinfo::collect().await,
        api_key: reg.api_key.expose_secret().to_string(),
    };
    info!(
        server = %reg.server,
        capabilities = ?request.capabilities,
        tier = request.tier,
        capacity = request.capacity,
        "Registering agent"
    );
    let resp = client.register(&request).await?;
    if let Some(message) = &resp.message {
        info!(agent_id = %resp.agent_id, message = %message, "Registered");
    }

    config.server = Some(reg.server.clone());
    config.api_key = Some(reg.api_key.expose_secret().to_string());
    config.agent_id = Some(resp.agent_id);
    config.key = Some(resp.key);

    authenticate(&reg.server, config).await
}

/// Exchange the stored agent id and key for a fresh bearer token.
pub async fn authenticate(server: &str, config: &mut AgentConfig) -> Result<BrokerClient> {
    let (agent_id, key) = config.credentials()?;
    let client = BrokerClient::new(server);
    let auth = client.authenticate(&agent_id, &key).await?;
    if let Some(secs) = auth.expires_in {
        let expires_at = chrono::Utc::now() + chrono::Duration::seconds(secs as i64);
        info!(agent_id = %agent_id, expires_at = %expires_at.to_rfc3339(), "Authenticated");
    } else {
        info!(agent_id = %agent_id, "Authenticated");
    }

    config.jwt_token = Some(auth.token.clone());
    config.token_expires_in = auth.expires_in;
    Ok(client.with_token(SecretString::from(auth.token)))
}

/// `base` followed by any `extra` entries not already present.
pub fn merge_capabilities(base: Vec<String>, extra: Vec<String>) -> Vec<String> {
    let mut merged = base;
    for cap in extra {
        if !merged.contains(&cap) {
            merged.push(cap);
        }
    }
    merged
}
