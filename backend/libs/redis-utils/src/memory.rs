//! In-process backbone built on tokio broadcast channels.
//!
//! Semantics follow Redis pub/sub: a publish with no live subscriber is
//! dropped, and each subscriber sees every payload published after it
//! subscribed.

use crate::{Backbone, BackboneError, Subscription};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{timeout_at, Instant};
use tracing::warn;

const CHANNEL_CAPACITY: usize = 1024;

static SHARED: Lazy<MemoryBackbone> = Lazy::new(MemoryBackbone::new);
static NAMED: Lazy<std::sync::Mutex<HashMap<String, MemoryBackbone>>> =
    Lazy::new(|| std::sync::Mutex::new(HashMap::new()));

#[derive(Clone, Default)]
pub struct MemoryBackbone {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
}

impl MemoryBackbone {
    /// Fresh bus, isolated from every other instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide bus behind `memory://`
    pub fn shared() -> Self {
        SHARED.clone()
    }

    /// Process-wide bus registered under `name`
    pub fn named(name: &str) -> Self {
        let mut registry = NAMED.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.entry(name.to_string()).or_default().clone()
    }

    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    async fn release(&self, channel: &str) {
        let mut guard = self.channels.write().await;
        if guard
            .get(channel)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            guard.remove(channel);
        }
    }
}

#[async_trait]
impl Backbone for MemoryBackbone {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BackboneError> {
        if let Some(tx) = self.channels.read().await.get(channel) {
            // Err only means every receiver is gone
            let _ = tx.send(payload.to_vec());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, BackboneError> {
        let rx = {
            let mut guard = self.channels.write().await;
            guard
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        Ok(Box::new(MemorySubscription {
            rx,
            channel: channel.to_string(),
            backbone: self.clone(),
        }))
    }
}

struct MemorySubscription {
    rx: broadcast::Receiver<Vec<u8>>,
    channel: String,
    backbone: MemoryBackbone,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, BackboneError> {
        let deadline = Instant::now() + timeout;
        loop {
            match timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return Ok(None),
                Ok(Ok(payload)) => return Ok(Some(payload)),
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(channel = %self.channel, skipped, "memory backbone subscriber lagged");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(BackboneError::Closed),
            }
        }
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), BackboneError> {
        let MemorySubscription {
            rx,
            channel,
            backbone,
        } = *self;
        drop(rx);
        backbone.release(&channel).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let bus = MemoryBackbone::new();
        bus.publish("party:p1", b"lost").await.unwrap();

        let mut sub = bus.subscribe("party:p1").await.unwrap();
        let got = sub.next_message(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_fan_out_to_every_subscriber() {
        let bus = MemoryBackbone::new();
        let mut a = bus.subscribe("run:r1").await.unwrap();
        let mut b = bus.subscribe("run:r1").await.unwrap();
        let mut other = bus.subscribe("run:r2").await.unwrap();

        bus.publish("run:r1", b"one").await.unwrap();

        let timeout = Duration::from_millis(200);
        assert_eq!(a.next_message(timeout).await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(b.next_message(timeout).await.unwrap(), Some(b"one".to_vec()));
        assert!(other
            .next_message(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_channel() {
        let bus = MemoryBackbone::new();
        let a = bus.subscribe("run:r1").await.unwrap();
        let b = bus.subscribe("run:r1").await.unwrap();
        assert_eq!(bus.subscriber_count("run:r1").await, 2);

        a.unsubscribe().await.unwrap();
        assert_eq!(bus.subscriber_count("run:r1").await, 1);
        b.unsubscribe().await.unwrap();
        assert_eq!(bus.subscriber_count("run:r1").await, 0);
        assert!(bus.channels.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_named_instances_are_isolated_from_fresh_ones() {
        let named = MemoryBackbone::named("memory-isolation-test");
        let fresh = MemoryBackbone::new();
        let mut sub = named.subscribe("party:x").await.unwrap();

        fresh.publish("party:x", b"elsewhere").await.unwrap();
        assert!(sub
            .next_message(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());

        MemoryBackbone::named("memory-isolation-test")
            .publish("party:x", b"here")
            .await
            .unwrap();
        assert_eq!(
            sub.next_message(Duration::from_millis(200)).await.unwrap(),
            Some(b"here".to_vec())
        );
    }
}
