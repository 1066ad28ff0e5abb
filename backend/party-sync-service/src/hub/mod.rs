//! Channel broadcast hub
//!
//! [`PartyHub`] is the registry of [`ChannelSession`]s. It creates sessions
//! on first join or first broadcast, evicts them once they hold neither
//! connections nor history, serves WebSocket connections and forwards every
//! locally accepted event to the backbone tagged with this process's node id.

use crate::metrics;
use event_schema::{parse_frame, BackboneFrame, EventEnvelope, SchemaError};
use redis_utils::BackboneConnector;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod channel;
pub mod connection;
pub mod session;

pub use channel::{ChannelId, ChannelIdError, Scope};
pub use connection::{ClientSocket, CloseFrame, Connection, ConnectionId, SocketError};
pub use session::ChannelSession;

const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Hub tuning knobs
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub max_connections_per_channel: usize,
    pub max_channels: usize,
    pub history_limit: usize,
    pub action_dedupe_limit: usize,
    /// Backbone listener poll timeout
    pub poll_timeout: Duration,
    /// Listener sleep after an empty poll
    pub idle_sleep: Duration,
    /// Replay history expiry; `None` keeps entries until evicted by size
    pub history_ttl: Option<Duration>,
    pub heartbeat_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections_per_channel: 32,
            max_channels: 1000,
            history_limit: 50,
            action_dedupe_limit: 256,
            poll_timeout: Duration::from_secs(1),
            idle_sleep: Duration::from_millis(10),
            history_ttl: None,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Channel limit reached ({limit} channels)")]
    ChannelLimitReached { limit: usize },

    #[error("Channel at capacity: {channel} ({cap} connections)")]
    ChannelFull { channel: ChannelId, cap: usize },

    #[error("channel session was retired")]
    SessionRetired,

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A connection admitted to a channel but not yet served
///
/// Obtained from [`PartyHub::admit`] before the WebSocket handshake completes;
/// hand it to [`PartyHub::serve`] once the socket is up, or to
/// [`PartyHub::release`] if the handshake fails.
pub struct Admission {
    channel: ChannelId,
    session: Arc<ChannelSession>,
    connection_id: ConnectionId,
    outbox: UnboundedReceiver<String>,
}

impl Admission {
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }
}

enum FrameError {
    Invalid(SchemaError),
    Internal(HubError),
}

pub struct PartyHub {
    config: Arc<HubConfig>,
    connector: Arc<BackboneConnector>,
    sessions: RwLock<HashMap<ChannelId, Arc<ChannelSession>>>,
    node_id: Arc<str>,
}

impl PartyHub {
    pub fn new(config: HubConfig, connector: Arc<BackboneConnector>) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            sessions: RwLock::new(HashMap::new()),
            node_id: Arc::from(Uuid::new_v4().simple().to_string()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Connect the backbone; an unreachable backbone leaves the hub local-only.
    pub async fn start(&self) {
        match self.connector.ensure_connected().await {
            Ok(()) => info!(
                node_id = %self.node_id,
                backbone = %self.connector.describe(),
                "party hub started"
            ),
            Err(e) => warn!(
                node_id = %self.node_id,
                backbone = %self.connector.describe(),
                error = %e,
                "backbone unavailable at startup, running in local-only mode"
            ),
        }
    }

    /// Stop every session listener, drop all connections, close the backbone.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<ChannelSession>> = {
            let mut guard = self.sessions.write().await;
            let drained = guard.drain().map(|(_, session)| session).collect();
            metrics::CHANNELS.set(0);
            drained
        };

        info!(sessions = sessions.len(), "party hub shutting down");
        for session in sessions {
            session.close().await;
        }
        self.connector.close().await;
    }

    /// Existing session for `channel`, or a new one if under the channel cap.
    pub async fn acquire_session(&self, channel: &ChannelId) -> Result<Arc<ChannelSession>, HubError> {
        if let Some(session) = self.sessions.read().await.get(channel) {
            return Ok(session.clone());
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(channel) {
            return Ok(session.clone());
        }

        if sessions.len() >= self.config.max_channels {
            warn!(channel = %channel, limit = self.config.max_channels, "channel limit reached");
            return Err(HubError::ChannelLimitReached {
                limit: self.config.max_channels,
            });
        }

        let session = Arc::new(ChannelSession::new(
            channel.clone(),
            self.config.clone(),
            self.connector.clone(),
            self.node_id.clone(),
        ));
        sessions.insert(channel.clone(), session.clone());
        metrics::CHANNELS.set(sessions.len() as i64);
        debug!(channel = %channel, total = sessions.len(), "channel session created");
        Ok(session)
    }

    pub async fn session(&self, channel: &ChannelId) -> Option<Arc<ChannelSession>> {
        self.sessions.read().await.get(channel).cloned()
    }

    pub async fn channel_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn connection_count(&self, channel: &ChannelId) -> usize {
        match self.session(channel).await {
            Some(session) => session.connection_count().await,
            None => 0,
        }
    }

    /// Reserve a slot on `channel` and replay its history into the new outbox.
    pub async fn admit(&self, channel: &ChannelId) -> Result<Admission, HubError> {
        loop {
            let session = match self.acquire_session(channel).await {
                Ok(session) => session,
                Err(e) => {
                    metrics::REJECTED_CONNECTIONS_TOTAL
                        .with_label_values(&[metrics::REASON_CHANNEL_LIMIT])
                        .inc();
                    return Err(e);
                }
            };
            let (connection, outbox) = Connection::new();
            let connection_id = connection.id();

            match session.connect(connection).await {
                Ok(()) => {
                    return Ok(Admission {
                        channel: channel.clone(),
                        session,
                        connection_id,
                        outbox,
                    })
                }
                // evicted between lookup and connect; take the fresh one
                Err(HubError::SessionRetired) => continue,
                Err(e) => {
                    metrics::REJECTED_CONNECTIONS_TOTAL
                        .with_label_values(&[metrics::REASON_CONNECTION_LIMIT])
                        .inc();
                    warn!(channel = %channel, error = %e, "connection rejected");
                    return Err(e);
                }
            }
        }
    }

    /// Give back an admission whose socket never came up.
    pub async fn release(&self, admission: Admission) {
        let Admission {
            channel,
            session,
            connection_id,
            ..
        } = admission;
        session.disconnect(connection_id).await;
        self.maybe_cleanup_session(&channel).await;
    }

    /// Serve one socket on `channel` until it closes.
    ///
    /// Capacity rejections close the socket (1001) without serving it.
    pub async fn handle_connection<S: ClientSocket>(&self, channel: &ChannelId, mut socket: S) {
        match self.admit(channel).await {
            Ok(admission) => self.serve(admission, socket).await,
            Err(HubError::ChannelLimitReached { .. }) => {
                socket.close(CloseFrame::channel_limit()).await
            }
            Err(HubError::ChannelFull { .. }) => socket.close(CloseFrame::at_capacity()).await,
            Err(e) => {
                error!(channel = %channel, error = %e, "failed to admit connection");
                socket.close(CloseFrame::internal()).await;
            }
        }
    }

    /// Receive loop for an admitted socket.
    pub async fn serve<S: ClientSocket>(&self, admission: Admission, mut socket: S) {
        let Admission {
            channel,
            session,
            connection_id,
            mut outbox,
        } = admission;

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(channel = %channel, connection_id = %connection_id, "websocket connected");

        let close = loop {
            tokio::select! {
                outbound = outbox.recv() => match outbound {
                    Some(frame) => {
                        if let Err(e) = socket.send(frame).await {
                            debug!(channel = %channel, connection_id = %connection_id, error = %e, "send failed, dropping connection");
                            break None;
                        }
                    }
                    // session dropped us (shutdown)
                    None => break Some(CloseFrame::shutting_down()),
                },
                inbound = socket.recv() => match inbound {
                    None => break Some(CloseFrame::normal()),
                    Some(Err(SocketError::UnsupportedFrame(kind))) => {
                        warn!(channel = %channel, connection_id = %connection_id, kind, "unsupported frame");
                        break Some(CloseFrame::invalid_payload(format!("{kind} frames are not supported")));
                    }
                    Some(Err(SocketError::Closed)) => break None,
                    Some(Err(e)) => {
                        error!(channel = %channel, connection_id = %connection_id, error = %e, "websocket receive failed");
                        break Some(CloseFrame::internal());
                    }
                    Some(Ok(text)) => match self.handle_frame(&channel, &session, connection_id, &text).await {
                        Ok(()) => {}
                        Err(FrameError::Invalid(e)) => {
                            warn!(channel = %channel, connection_id = %connection_id, error = %e, "invalid client payload");
                            break Some(CloseFrame::invalid_payload(e));
                        }
                        Err(FrameError::Internal(e)) => {
                            error!(channel = %channel, connection_id = %connection_id, error = %e, frame = %text, "failed to process client frame");
                            break Some(CloseFrame::internal());
                        }
                    },
                },
                _ = heartbeat.tick() => {
                    if socket.ping().await.is_err() {
                        break None;
                    }
                }
            }
        };

        if let Some(frame) = close {
            socket.close(frame).await;
        }

        session.disconnect(connection_id).await;
        self.maybe_cleanup_session(&channel).await;
        info!(channel = %channel, connection_id = %connection_id, "websocket disconnected");
    }

    async fn handle_frame(
        &self,
        channel: &ChannelId,
        session: &ChannelSession,
        sender: ConnectionId,
        text: &str,
    ) -> Result<(), FrameError> {
        let message = parse_frame(text).map_err(FrameError::Invalid)?;

        let outcome = session
            .register(message.clone(), true, Some(sender))
            .await
            .map_err(FrameError::Internal)?;
        if let Some(delivered) = outcome {
            metrics::BROADCASTS_TOTAL
                .with_label_values(&[metrics::SOURCE_SOCKET])
                .inc();
            debug!(channel = %channel, event_type = %message.event_type, delivered, "client event fanned out");
        }

        self.publish_to_backbone(channel, &message).await;
        Ok(())
    }

    /// Entry point for non-socket producers.
    ///
    /// Always forwards to the backbone. With `propagate_local` the event is
    /// also recorded and fanned out here, and the local delivery count is
    /// returned; otherwise local sockets only see it if it comes back from
    /// another replica, and the result is 0.
    pub async fn publish(
        &self,
        channel: &ChannelId,
        message: EventEnvelope,
        propagate_local: bool,
    ) -> Result<usize, HubError> {
        let delivered = if propagate_local {
            loop {
                let session = self.acquire_session(channel).await?;
                match session
                    .register_and_broadcast(message.clone(), true, None)
                    .await
                {
                    Err(HubError::SessionRetired) => continue,
                    other => break other?,
                }
            }
        } else {
            0
        };

        self.publish_to_backbone(channel, &message).await;
        self.maybe_cleanup_session(channel).await;
        Ok(delivered)
    }

    async fn publish_to_backbone(&self, channel: &ChannelId, message: &EventEnvelope) {
        let frame = match BackboneFrame::new(self.node_id.as_ref(), message.clone()).encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(channel = %channel, error = %e, "failed to encode backbone frame");
                return;
            }
        };

        let result = match self.connector.get_client().await {
            Ok(client) => client.publish(channel.as_str(), &frame).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            metrics::BACKBONE_PUBLISH_FAILURES_TOTAL.inc();
            warn!(channel = %channel, error = %e, "backbone publish failed, delivered locally only");
        }
    }

    /// Evict `channel` if its session has neither connections nor history.
    pub async fn maybe_cleanup_session(&self, channel: &ChannelId) {
        let Some(candidate) = self.session(channel).await else {
            return;
        };
        // The session's own lock is taken outside the registry lock; a
        // retired session refuses new work until it is removed below.
        if !candidate.retire_if_idle().await {
            return;
        }

        let evicted = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(channel) {
                Some(current) if Arc::ptr_eq(current, &candidate) => {
                    let evicted = sessions.remove(channel);
                    metrics::CHANNELS.set(sessions.len() as i64);
                    evicted
                }
                _ => None,
            }
        };

        if let Some(session) = evicted {
            session.stop_listener().await;
            debug!(channel = %channel, "channel session evicted");
        }
    }

    /// Drop expired history everywhere and evict sessions left idle.
    pub async fn sweep_expired_history(&self) -> usize {
        let Some(ttl) = self.config.history_ttl else {
            return 0;
        };

        let sessions: Vec<Arc<ChannelSession>> =
            self.sessions.read().await.values().cloned().collect();

        let mut pruned = 0;
        for session in sessions {
            let removed = session.prune_expired(ttl).await;
            if removed > 0 {
                pruned += removed;
                self.maybe_cleanup_session(session.channel()).await;
            }
        }

        if pruned > 0 {
            debug!(pruned, "expired history entries removed");
        }
        pruned
    }
}

/// Periodically expire history until `shutdown` flips; `None` when no TTL is set.
pub fn spawn_history_sweeper(
    hub: Arc<PartyHub>,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    let ttl = hub.config.history_ttl?;
    let period = ttl.clamp(Duration::from_millis(10), MAX_SWEEP_INTERVAL);

    Some(tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    hub.sweep_expired_history().await;
                }
            }
        }
        debug!("history sweeper stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_schema::Payload;
    use redis_utils::MemoryBackbone;

    fn hub_with(config: HubConfig) -> PartyHub {
        let connector = Arc::new(BackboneConnector::with_backbone(Arc::new(MemoryBackbone::new())));
        PartyHub::new(config, connector)
    }

    fn event() -> EventEnvelope {
        EventEnvelope::new("system.tick", Payload::new())
    }

    #[tokio::test]
    async fn test_channel_cap_rejects_new_sessions() {
        let hub = hub_with(HubConfig {
            max_channels: 1,
            ..HubConfig::default()
        });
        let first: ChannelId = "run:a".parse().unwrap();
        let second: ChannelId = "run:b".parse().unwrap();

        hub.publish(&first, event(), true).await.unwrap();
        let err = hub.publish(&second, event(), true).await.unwrap_err();
        assert!(matches!(err, HubError::ChannelLimitReached { limit: 1 }));
        // existing channel still accepts traffic
        assert!(hub.publish(&first, event(), true).await.is_ok());
        assert_eq!(hub.channel_count().await, 1);
    }

    #[tokio::test]
    async fn test_publish_without_local_propagation_evicts_empty_session() {
        let hub = hub_with(HubConfig::default());
        let channel: ChannelId = "party:p1".parse().unwrap();

        assert_eq!(hub.publish(&channel, event(), false).await.unwrap(), 0);
        assert!(hub.session(&channel).await.is_none());

        assert_eq!(hub.publish(&channel, event(), true).await.unwrap(), 0);
        let session = hub.session(&channel).await.unwrap();
        assert_eq!(session.history_len().await, 1);
    }

    #[tokio::test]
    async fn test_release_evicts_session_without_history() {
        let hub = hub_with(HubConfig::default());
        let channel: ChannelId = "run:r1".parse().unwrap();

        let admission = hub.admit(&channel).await.unwrap();
        assert_eq!(hub.connection_count(&channel).await, 1);
        hub.release(admission).await;
        assert_eq!(hub.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired_idle_sessions() {
        let hub = hub_with(HubConfig {
            history_ttl: Some(Duration::from_millis(1)),
            ..HubConfig::default()
        });
        let channel: ChannelId = "run:old".parse().unwrap();
        hub.publish(&channel, event(), true).await.unwrap();
        assert_eq!(hub.channel_count().await, 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hub.sweep_expired_history().await, 1);
        assert_eq!(hub.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_does_not_block_other_channels() {
        let hub = Arc::new(hub_with(HubConfig::default()));
        let busy: ChannelId = "run:busy".parse().unwrap();
        let other: ChannelId = "run:other".parse().unwrap();
        let session = hub.acquire_session(&busy).await.unwrap();

        let (locked_tx, locked_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel();
        let holder = {
            let session = session.clone();
            tokio::spawn(async move { session.hold_state(locked_tx, release_rx).await })
        };
        locked_rx.await.unwrap();

        let cleanup = {
            let hub = hub.clone();
            let busy = busy.clone();
            tokio::spawn(async move { hub.maybe_cleanup_session(&busy).await })
        };
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        // cleanup is parked on the busy session, not on the registry
        tokio::time::timeout(Duration::from_secs(1), hub.acquire_session(&other))
            .await
            .expect("registry stayed locked during cleanup")
            .unwrap();

        release_tx.send(()).unwrap();
        holder.await.unwrap();
        cleanup.await.unwrap();
        assert!(hub.session(&busy).await.is_none());
        assert!(hub.session(&other).await.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_socket_action_is_not_counted_as_broadcast() {
        let hub = hub_with(HubConfig::default());
        let channel: ChannelId = "run:votes".parse().unwrap();
        let admission = hub.admit(&channel).await.unwrap();
        let session = admission.session.clone();
        let vote = r#"{"eventType":"vote.cast","actionId":"v-1","payload":{"optionId":"o1","tally":1}}"#;

        let counter = metrics::BROADCASTS_TOTAL.with_label_values(&[metrics::SOURCE_SOCKET]);
        hub.handle_frame(&channel, &session, admission.connection_id, vote)
            .await
            .ok()
            .unwrap();
        let after_first = counter.get();
        hub.handle_frame(&channel, &session, admission.connection_id, vote)
            .await
            .ok()
            .unwrap();

        assert_eq!(counter.get(), after_first);
        assert_eq!(session.history_len().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_sessions() {
        let hub = hub_with(HubConfig::default());
        let channel: ChannelId = "run:r1".parse().unwrap();
        let mut admission = hub.admit(&channel).await.unwrap();
        let session = hub.session(&channel).await.unwrap();
        assert!(session.listener_running().await);

        hub.shutdown().await;
        assert_eq!(hub.channel_count().await, 0);
        assert!(!session.listener_running().await);
        // the outbox is closed so a serving task would stop
        assert!(admission.outbox.recv().await.is_none());
    }
}
