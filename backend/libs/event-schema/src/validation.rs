//! Structural validation of inbound envelopes
//!
//! The schema is picked from `eventType`:
//! - prefix rules: `system.`, `party.`, `action.`, `vote.`
//! - exact rules: `scene.update`, `combat.update`
//! - everything else falls back to the generic rule (`eventType` + `payload`)
//!
//! Validation runs on the raw JSON value so that error messages name the
//! offending wire field, then the value is deserialized into an
//! [`EventEnvelope`].

use crate::EventEnvelope;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("message must be a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(String),

    #[error("field `{field}` must be {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },
}

/// Closed set of envelope schemas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSchema {
    System,
    Party,
    Action,
    Vote,
    SceneUpdate,
    CombatUpdate,
    Generic,
}

impl EventSchema {
    pub fn for_event_type(event_type: &str) -> Self {
        match event_type {
            "scene.update" => Self::SceneUpdate,
            "combat.update" => Self::CombatUpdate,
            t if t.starts_with("system.") => Self::System,
            t if t.starts_with("party.") => Self::Party,
            t if t.starts_with("action.") => Self::Action,
            t if t.starts_with("vote.") => Self::Vote,
            _ => Self::Generic,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Party => "party",
            Self::Action => "action",
            Self::Vote => "vote",
            Self::SceneUpdate => "scene.update",
            Self::CombatUpdate => "combat.update",
            Self::Generic => "generic",
        }
    }

    fn rules(&self) -> &'static [FieldRule] {
        match self {
            Self::System | Self::Generic => &[],
            Self::Party => PARTY_RULES,
            Self::Action => ACTION_RULES,
            Self::Vote => VOTE_RULES,
            Self::SceneUpdate => SCENE_UPDATE_RULES,
            Self::CombatUpdate => COMBAT_UPDATE_RULES,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    String,
    NonEmptyString,
    Number,
    StringOrNumber,
    Object,
    Array,
}

impl Kind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Kind::String => value.is_string(),
            Kind::NonEmptyString => value.as_str().is_some_and(|s| !s.is_empty()),
            Kind::Number => value.is_number(),
            Kind::StringOrNumber => value.is_string() || value.is_number(),
            Kind::Object => value.is_object(),
            Kind::Array => value.is_array(),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Kind::String => "a string",
            Kind::NonEmptyString => "a non-empty string",
            Kind::Number => "a number",
            Kind::StringOrNumber => "a string or a number",
            Kind::Object => "an object",
            Kind::Array => "an array",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Location {
    Envelope,
    Payload,
}

#[derive(Debug, Clone, Copy)]
struct FieldRule {
    location: Location,
    name: &'static str,
    kind: Kind,
    required: bool,
}

impl FieldRule {
    const fn payload(name: &'static str, kind: Kind, required: bool) -> Self {
        Self {
            location: Location::Payload,
            name,
            kind,
            required,
        }
    }

    const fn envelope(name: &'static str, kind: Kind, required: bool) -> Self {
        Self {
            location: Location::Envelope,
            name,
            kind,
            required,
        }
    }

    fn path(&self) -> String {
        match self.location {
            Location::Envelope => self.name.to_string(),
            Location::Payload => format!("payload.{}", self.name),
        }
    }

    fn check(&self, envelope: &Map<String, Value>, payload: &Map<String, Value>) -> Result<(), SchemaError> {
        let source = match self.location {
            Location::Envelope => envelope,
            Location::Payload => payload,
        };
        match source.get(self.name) {
            None | Some(Value::Null) if self.required => Err(SchemaError::MissingField(self.path())),
            None | Some(Value::Null) => Ok(()),
            Some(value) if self.kind.matches(value) => Ok(()),
            Some(_) => Err(SchemaError::WrongType {
                field: self.path(),
                expected: self.kind.describe(),
            }),
        }
    }
}

// Optional top-level metadata shared by every schema
const COMMON_RULES: &[FieldRule] = &[
    FieldRule::envelope("traceId", Kind::String, false),
    FieldRule::envelope("senderId", Kind::String, false),
    FieldRule::envelope("actionId", Kind::String, false),
    FieldRule::envelope("channel", Kind::String, false),
];

const PARTY_RULES: &[FieldRule] = &[
    FieldRule::payload("partyId", Kind::StringOrNumber, true),
    FieldRule::payload("status", Kind::String, false),
    FieldRule::payload("memberId", Kind::StringOrNumber, false),
];

const ACTION_RULES: &[FieldRule] = &[
    FieldRule::envelope("actionId", Kind::NonEmptyString, true),
    FieldRule::payload("action", Kind::Object, true),
    FieldRule::payload("runId", Kind::String, false),
    FieldRule::payload("sceneId", Kind::String, false),
    FieldRule::payload("actorId", Kind::StringOrNumber, false),
];

const VOTE_RULES: &[FieldRule] = &[
    FieldRule::payload("optionId", Kind::StringOrNumber, true),
    FieldRule::payload("tally", Kind::Number, true),
];

const SCENE_UPDATE_RULES: &[FieldRule] = &[
    FieldRule::payload("sceneId", Kind::String, true),
    FieldRule::payload("phase", Kind::String, true),
    FieldRule::payload("status", Kind::String, false),
    FieldRule::payload("outcome", Kind::Object, false),
];

const COMBAT_UPDATE_RULES: &[FieldRule] = &[
    FieldRule::payload("sceneId", Kind::String, true),
    FieldRule::payload("phase", Kind::String, true),
    FieldRule::payload("effects", Kind::Array, false),
    FieldRule::payload("outcome", Kind::Object, false),
];

/// Check a raw JSON message and report which schema it satisfied
pub fn validate_value(value: &Value) -> Result<EventSchema, SchemaError> {
    let envelope = value.as_object().ok_or(SchemaError::NotAnObject)?;

    let event_type = match envelope.get("eventType") {
        None | Some(Value::Null) => return Err(SchemaError::MissingField("eventType".into())),
        Some(Value::String(s)) if !s.is_empty() => s.as_str(),
        Some(_) => {
            return Err(SchemaError::WrongType {
                field: "eventType".into(),
                expected: Kind::NonEmptyString.describe(),
            })
        }
    };

    let payload = match envelope.get("payload") {
        None | Some(Value::Null) => return Err(SchemaError::MissingField("payload".into())),
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(SchemaError::WrongType {
                field: "payload".into(),
                expected: Kind::Object.describe(),
            })
        }
    };

    let schema = EventSchema::for_event_type(event_type);
    // Typed rules run first so a required actionId reports as missing, not mistyped
    for rule in schema.rules().iter().chain(COMMON_RULES) {
        rule.check(envelope, payload)?;
    }

    Ok(schema)
}

/// Validate a raw JSON message and convert it into a typed envelope
pub fn validate_envelope(value: &Value) -> Result<EventEnvelope, SchemaError> {
    validate_value(value)?;
    serde_json::from_value(value.clone()).map_err(|e| SchemaError::Malformed(e.to_string()))
}

/// Parse and validate one text frame received from a client socket
pub fn parse_frame(text: &str) -> Result<EventEnvelope, SchemaError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| SchemaError::Malformed(e.to_string()))?;
    validate_envelope(&value)
}
