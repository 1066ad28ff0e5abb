//! Broadcast capability for business code
//!
//! Campaign logic publishes derived events through a [`Notifier`] without
//! knowing about sockets or the backbone. Three implementations exist:
//!
//! - [`PartyHub`] itself, for callers living in the same process
//! - [`BackboneNotifier`], which only publishes onto the backbone so that
//!   every hub replica delivers the event
//! - [`HttpNotifier`], which calls a remote hub's broadcast endpoint
//!
//! Channel ids may be given in full (`party:p1`) or as a bare campaign id,
//! which addresses `run:<id>`.

use crate::hub::{ChannelId, ChannelIdError, HubError, PartyHub};
use async_trait::async_trait;
use event_schema::{BackboneFrame, EventEnvelope, Payload, SchemaError};
use redis_utils::{BackboneConnector, BackboneError};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid event: {0}")]
    Invalid(#[from] SchemaError),

    #[error("invalid channel: {0}")]
    Channel(#[from] ChannelIdError),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("backbone error: {0}")]
    Backbone(#[from] BackboneError),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("broadcast rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish one event; returns how many local sockets received it, where known.
    async fn broadcast(
        &self,
        channel_id: &str,
        event_type: &str,
        payload: Payload,
        trace_id: Option<String>,
    ) -> Result<usize, NotifyError>;
}

/// Translate campaign lifecycle event names into the client-facing schema.
pub fn map_event_type(event_type: &str, payload: &Payload) -> String {
    if event_type.starts_with("campaign.scene") {
        let scene_type = payload
            .get("sceneType")
            .or_else(|| payload.get("scene_type"))
            .and_then(Value::as_str);
        if scene_type.is_some_and(|kind| kind.eq_ignore_ascii_case("combat")) {
            return "combat.update".to_string();
        }
        return "scene.update".to_string();
    }
    if event_type.starts_with("campaign.phase") || event_type.starts_with("campaign.completed") {
        return "scene.update".to_string();
    }
    event_type.to_string()
}

fn build_envelope(
    event_type: &str,
    payload: Payload,
    trace_id: Option<String>,
) -> Result<EventEnvelope, SchemaError> {
    let mut message = EventEnvelope::new(map_event_type(event_type, &payload), payload);
    message.trace_id = trace_id;
    message.validate()?;
    Ok(message)
}

#[async_trait]
impl Notifier for PartyHub {
    async fn broadcast(
        &self,
        channel_id: &str,
        event_type: &str,
        payload: Payload,
        trace_id: Option<String>,
    ) -> Result<usize, NotifyError> {
        let channel = ChannelId::resolve(channel_id)?;
        let message = build_envelope(event_type, payload, trace_id)?;
        Ok(self.publish(&channel, message, true).await?)
    }
}

/// Publishes straight onto the backbone under its own node id
///
/// Every hub subscribed to the channel, including one in this process,
/// delivers the event. Local delivery counts are unknown, so 0 is returned.
pub struct BackboneNotifier {
    connector: Arc<BackboneConnector>,
    node_id: String,
}

impl BackboneNotifier {
    pub fn new(connector: Arc<BackboneConnector>) -> Self {
        Self {
            connector,
            node_id: Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[async_trait]
impl Notifier for BackboneNotifier {
    async fn broadcast(
        &self,
        channel_id: &str,
        event_type: &str,
        payload: Payload,
        trace_id: Option<String>,
    ) -> Result<usize, NotifyError> {
        let channel = ChannelId::resolve(channel_id)?;
        let message = build_envelope(event_type, payload, trace_id)?;
        let frame = BackboneFrame::new(self.node_id.as_str(), message).encode()?;

        let client = self.connector.get_client().await?;
        client.publish(channel.as_str(), &frame).await?;
        debug!(channel = %channel, "event published to backbone");
        Ok(0)
    }
}

#[derive(Debug, Deserialize)]
struct BroadcastAck {
    #[allow(dead_code)]
    accepted: bool,
    delivered: usize,
}

/// Calls `POST {base}/v1/campaigns/{entity}/broadcast` on a remote hub
pub struct HttpNotifier {
    base_url: String,
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    async fn post(&self, channel: &ChannelId, message: &EventEnvelope) -> Result<usize, NotifyError> {
        let url = format!("{}/v1/campaigns/{}/broadcast", self.base_url, channel.entity());

        let mut body = serde_json::to_value(message)?;
        if let Value::Object(fields) = &mut body {
            fields.insert("campaignId".into(), Value::String(channel.entity().to_string()));
            fields.insert("channel".into(), Value::String(channel.to_string()));
        }

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let ack: BroadcastAck = response.json().await?;
        Ok(ack.delivered)
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn broadcast(
        &self,
        channel_id: &str,
        event_type: &str,
        payload: Payload,
        trace_id: Option<String>,
    ) -> Result<usize, NotifyError> {
        let channel = ChannelId::resolve(channel_id)?;
        let message = build_envelope(event_type, payload, trace_id)?;

        let result = self.post(&channel, &message).await;
        if let Err(e) = &result {
            warn!(channel = %channel, event_type = %message.event_type, error = %e, "remote broadcast failed");
        }
        result
    }
}
