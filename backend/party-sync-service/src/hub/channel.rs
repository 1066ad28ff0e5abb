use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Broadcast scope of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Party,
    Run,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Party => "party",
            Scope::Run => "run",
        }
    }
}

impl FromStr for Scope {
    type Err = ChannelIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "party" => Ok(Scope::Party),
            "run" => Ok(Scope::Run),
            other => Err(ChannelIdError::UnknownScope(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelIdError {
    #[error("unknown channel scope `{0}` (expected party or run)")]
    UnknownScope(String),

    #[error("channel id must look like <scope>:<entity>, got `{0}`")]
    Malformed(String),

    #[error("channel entity id must not be empty")]
    EmptyEntity,
}

/// Channel identifier, `"party:<id>"` or `"run:<id>"`
///
/// The formatted string is also the backbone channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId {
    scope: Scope,
    entity: String,
    key: String,
}

impl ChannelId {
    pub fn new(scope: Scope, entity: impl Into<String>) -> Result<Self, ChannelIdError> {
        let entity = entity.into();
        if entity.is_empty() {
            return Err(ChannelIdError::EmptyEntity);
        }
        let key = format!("{}:{}", scope.as_str(), entity);
        Ok(Self { scope, entity, key })
    }

    pub fn party(entity: impl Into<String>) -> Result<Self, ChannelIdError> {
        Self::new(Scope::Party, entity)
    }

    pub fn run(entity: impl Into<String>) -> Result<Self, ChannelIdError> {
        Self::new(Scope::Run, entity)
    }

    /// Full channel id if `raw` carries a scope, otherwise a campaign run id.
    pub fn resolve(raw: &str) -> Result<Self, ChannelIdError> {
        if raw.contains(':') {
            raw.parse()
        } else {
            Self::run(raw)
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl FromStr for ChannelId {
    type Err = ChannelIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scope, entity) = s
            .split_once(':')
            .ok_or_else(|| ChannelIdError::Malformed(s.to_string()))?;
        Self::new(scope.parse()?, entity)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}
