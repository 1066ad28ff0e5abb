//! Event envelope shared by party-sync sockets, replicas and HTTP producers
//!
//! Every frame on a channel socket, every backbone publish and every HTTP
//! broadcast body carries exactly one `EventEnvelope`. Keys are camelCase on
//! the wire and absent optionals are omitted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// Per-event-type structural validation
pub mod validation;

pub use validation::{parse_frame, validate_envelope, validate_value, EventSchema, SchemaError};

/// Structured event payload (always a JSON object)
pub type Payload = Map<String, Value>;

/// Unit of exchange on a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_type: String,
    pub payload: Payload,
    /// Request trace id for log correlation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Producer identity, opaque to the hub
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    /// Client action id; present only on action events and used for dedup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    /// Target channel hint ("party:<id>" / "run:<id>")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            trace_id: None,
            sender_id: None,
            action_id: None,
            channel: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_sender_id(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    pub fn with_action_id(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = Some(action_id.into());
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Schema this envelope is checked against
    pub fn schema(&self) -> EventSchema {
        EventSchema::for_event_type(&self.event_type)
    }

    /// Validate an already-typed envelope (HTTP producers, notifier)
    pub fn validate(&self) -> Result<EventSchema, SchemaError> {
        let value =
            serde_json::to_value(self).map_err(|e| SchemaError::Malformed(e.to_string()))?;
        validate_value(&value)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// One replayable history slot
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub event: EventEnvelope,
    pub created_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(event: EventEnvelope) -> Self {
        Self {
            event,
            created_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.signed_duration_since(self.created_at) > ttl
    }
}

/// Frame published on the backbone: the envelope tagged with its origin node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneFrame {
    pub origin: String,
    pub message: EventEnvelope,
}

impl BackboneFrame {
    pub fn new(origin: impl Into<String>, message: EventEnvelope) -> Self {
        Self {
            origin: origin.into(),
            message,
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
