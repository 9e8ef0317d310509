//! Replication delivery channels
//!
//! - [`GithubDispatchChannel`]: repository dispatch event over the GitHub REST API
//! - [`LogChannel`]: logs envelopes and accepts them (replication disabled, dry runs)

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use tracing::info;

use replimesh_core::ReplicationConfig;

use super::envelope::ReplicationEnvelope;

/// Longest error body kept from a rejected delivery
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("replication transport error: {reason}")]
    Transport { reason: String },

    #[error("replication rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("failed to encode envelope: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outbound, best-effort transport for replication envelopes
#[async_trait]
pub trait ReplicationChannel: Send + Sync {
    async fn deliver(&self, envelope: &ReplicationEnvelope) -> Result<(), ChannelError>;
}

pub struct GithubDispatchChannel {
    client: Client,
    url: String,
    token: String,
}

impl GithubDispatchChannel {
    pub fn new(url: impl Into<String>, token: impl Into<String>, client: Client) -> Self {
        Self {
            client,
            url: url.into(),
            token: token.into(),
        }
    }

    pub fn from_config(config: &ReplicationConfig) -> Result<Self, ChannelError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("replimesh/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ChannelError::Transport {
                reason: e.to_string(),
            })?;
        Ok(Self::new(config.dispatch_url(), config.token.clone(), client))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ReplicationChannel for GithubDispatchChannel {
    async fn deliver(&self, envelope: &ReplicationEnvelope) -> Result<(), ChannelError> {
        let response = self
            .client
            .post(&self.url)
            .header(ACCEPT, "application/vnd.github.v3+json")
            .bearer_auth(&self.token)
            .json(envelope)
            .send()
            .await
            .map_err(|e| ChannelError::Transport {
                reason: e.to_string(),
            })?;

        // The dispatch endpoint answers 204 No Content on acceptance
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let body = if body.len() > MAX_ERROR_BODY {
            let cut = (0..=MAX_ERROR_BODY)
                .rev()
                .find(|i| body.is_char_boundary(*i))
                .unwrap_or(0);
            format!("{}...", &body[..cut])
        } else {
            body
        };
        Err(ChannelError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

#[async_trait]
impl ReplicationChannel for LogChannel {
    async fn deliver(&self, envelope: &ReplicationEnvelope) -> Result<(), ChannelError> {
        let body = serde_json::to_string(envelope)?;
        info!(
            event_type = %envelope.event_type,
            operation = %envelope.operation().kind,
            collection = %envelope.operation().collection,
            destinations = envelope.destinations().len(),
            body = %body,
            "replication envelope (log only)"
        );
        Ok(())
    }
}
