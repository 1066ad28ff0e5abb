use crate::{Backbone, BackboneError, SharedConnectionManager, Subscription};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Redis pub/sub backbone.
///
/// Publishes go through one multiplexed connection manager (reconnects on its
/// own); every subscription gets a dedicated pub/sub connection.
pub struct RedisBackbone {
    client: Client,
    manager: SharedConnectionManager,
}

impl RedisBackbone {
    pub async fn connect(redis_url: &str) -> Result<Self, BackboneError> {
        let client = Client::open(redis_url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            manager: Arc::new(Mutex::new(manager)),
        })
    }

    pub fn manager(&self) -> SharedConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl Backbone for RedisBackbone {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BackboneError> {
        // ConnectionManager is a cheap handle; don't hold the lock across the round trip
        let mut conn = self.manager.lock().await.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, BackboneError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        debug!(channel, "redis subscription opened");
        Ok(Box::new(RedisSubscription {
            pubsub,
            channel: channel.to_string(),
        }))
    }
}

struct RedisSubscription {
    pubsub: PubSub,
    channel: String,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, BackboneError> {
        let mut messages = self.pubsub.on_message();
        match tokio::time::timeout(timeout, messages.next()).await {
            Err(_) => Ok(None),
            Ok(Some(msg)) => Ok(Some(msg.get_payload_bytes().to_vec())),
            Ok(None) => Err(BackboneError::Closed),
        }
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), BackboneError> {
        let mut this = *self;
        this.pubsub.unsubscribe(&this.channel).await?;
        debug!(channel = %this.channel, "redis subscription closed");
        Ok(())
    }
}
