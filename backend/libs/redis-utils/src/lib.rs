//! Publish/subscribe backbone shared by party-sync replicas
//!
//! Callers see two capabilities, [`Backbone::publish`] and
//! [`Backbone::subscribe`], satisfied either by Redis pub/sub or by the
//! in-process [`MemoryBackbone`]. The [`BackboneConnector`] picks one from the
//! connection URL and builds it lazily, once per process:
//! - `memory://` shares one process-wide in-memory bus
//! - `memory://<name>` shares a named in-memory bus (isolated replicas in tests)
//! - anything else is handed to the Redis client

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

pub mod memory;
pub mod pubsub;

pub use memory::MemoryBackbone;
pub use pubsub::RedisBackbone;

/// Shared Redis connection manager guarded by a Tokio mutex.
pub type SharedConnectionManager = Arc<Mutex<redis::aio::ConnectionManager>>;

/// URL scheme selecting the in-process backbone
pub const MEMORY_SCHEME: &str = "memory://";

#[derive(Debug, Error)]
pub enum BackboneError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("subscription closed")]
    Closed,
}

/// Publish side of the backbone, shared by every session in the process
#[async_trait]
pub trait Backbone: Send + Sync {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BackboneError>;

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, BackboneError>;

    /// Release transport resources held by this backbone
    async fn close(&self) {}
}

/// One channel subscription owned by a single listener
#[async_trait]
pub trait Subscription: Send {
    /// Wait up to `timeout` for the next payload; `Ok(None)` means nothing arrived.
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, BackboneError>;

    async fn unsubscribe(self: Box<Self>) -> Result<(), BackboneError>;
}

enum Source {
    Url(String),
    Injected(Arc<dyn Backbone>),
}

/// Lazily built, process-wide backbone client
pub struct BackboneConnector {
    source: Source,
    client: RwLock<Option<Arc<dyn Backbone>>>,
}

impl BackboneConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            source: Source::Url(url.into()),
            client: RwLock::new(None),
        }
    }

    /// Wrap an already constructed backbone
    pub fn with_backbone(backbone: Arc<dyn Backbone>) -> Self {
        Self {
            source: Source::Injected(backbone),
            client: RwLock::new(None),
        }
    }

    /// URL with credentials stripped, for logs
    pub fn describe(&self) -> String {
        match &self.source {
            Source::Url(url) => redact(url),
            Source::Injected(_) => "injected".to_string(),
        }
    }

    pub async fn ensure_connected(&self) -> Result<(), BackboneError> {
        self.get_client().await.map(|_| ())
    }

    pub async fn get_client(&self) -> Result<Arc<dyn Backbone>, BackboneError> {
        if let Some(client) = self.client.read().await.as_ref() {
            return Ok(client.clone());
        }

        let mut guard = self.client.write().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }

        let client = self.build().await?;
        info!(backbone = %self.describe(), "backbone client connected");
        *guard = Some(client.clone());
        Ok(client)
    }

    pub async fn close(&self) {
        let client = self.client.write().await.take();
        if let Some(client) = client {
            client.close().await;
            debug!(backbone = %self.describe(), "backbone client closed");
        }
    }

    async fn build(&self) -> Result<Arc<dyn Backbone>, BackboneError> {
        match &self.source {
            Source::Injected(backbone) => Ok(backbone.clone()),
            Source::Url(url) => match url.strip_prefix(MEMORY_SCHEME) {
                Some("") => Ok(Arc::new(MemoryBackbone::shared())),
                Some(name) => Ok(Arc::new(MemoryBackbone::named(name))),
                None => Ok(Arc::new(RedisBackbone::connect(url).await?)),
            },
        }
    }
}

fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}
