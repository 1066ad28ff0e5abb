//! Per-channel session state
//!
//! A [`ChannelSession`] owns the connection set, the bounded replay history,
//! the bounded action-id dedup window and at most one backbone listener task.
//! All state mutations go through one tokio mutex so sockets on the same
//! channel and the listener see a single order of events.

use super::channel::ChannelId;
use super::connection::{Connection, ConnectionId};
use super::{HubConfig, HubError};
use crate::metrics;
use event_schema::{BackboneFrame, EventEnvelope, HistoryEntry};
use redis_utils::{BackboneConnector, Subscription};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

/// Bounded FIFO set of recently seen action ids
#[derive(Debug)]
pub(crate) struct DedupWindow {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl DedupWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(1024)),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`; false if it is already inside the window.
    pub(crate) fn insert(&mut self, id: &str) -> bool {
        if self.members.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.members.insert(id.to_string());
        true
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}

struct SessionState {
    connections: HashMap<ConnectionId, Connection>,
    history: VecDeque<HistoryEntry>,
    seen_actions: DedupWindow,
    // set once the hub evicted this session; late joiners must re-acquire
    retired: bool,
}

impl SessionState {
    fn push_history(&mut self, entry: HistoryEntry, limit: usize) {
        while self.history.len() >= limit.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }

    fn prune_expired(&mut self, ttl: Duration) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let now = chrono::Utc::now();
        let before = self.history.len();
        // entries are in insertion order, so expired ones form a prefix
        while self
            .history
            .front()
            .is_some_and(|entry| entry.is_expired(now, ttl))
        {
            self.history.pop_front();
        }
        before - self.history.len()
    }
}

struct ListenerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct ChannelSession {
    channel: ChannelId,
    config: Arc<HubConfig>,
    connector: Arc<BackboneConnector>,
    node_id: Arc<str>,
    state: Mutex<SessionState>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl ChannelSession {
    pub fn new(
        channel: ChannelId,
        config: Arc<HubConfig>,
        connector: Arc<BackboneConnector>,
        node_id: Arc<str>,
    ) -> Self {
        let seen_actions = DedupWindow::new(config.action_dedupe_limit);
        Self {
            channel,
            config,
            connector,
            node_id,
            state: Mutex::new(SessionState {
                connections: HashMap::new(),
                history: VecDeque::new(),
                seen_actions,
                retired: false,
            }),
            listener: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Admit a connection: replay history into its outbox, then start listening.
    pub async fn connect(self: &Arc<Self>, connection: Connection) -> Result<(), HubError> {
        {
            let mut state = self.state.lock().await;
            if state.retired {
                return Err(HubError::SessionRetired);
            }
            if state.connections.len() >= self.config.max_connections_per_channel {
                return Err(HubError::ChannelFull {
                    channel: self.channel.clone(),
                    cap: self.config.max_connections_per_channel,
                });
            }
            if let Some(ttl) = self.config.history_ttl {
                state.prune_expired(ttl);
            }

            // Replay goes into the outbox under the lock, so nothing live can
            // be queued ahead of it.
            for entry in &state.history {
                match entry.event.to_json() {
                    Ok(frame) => {
                        connection.send(frame);
                    }
                    Err(e) => warn!(channel = %self.channel, error = %e, "skipping unencodable history entry"),
                }
            }

            debug!(
                channel = %self.channel,
                connection_id = %connection.id(),
                replayed = state.history.len(),
                total = state.connections.len() + 1,
                "connection joined channel"
            );
            state.connections.insert(connection.id(), connection);
            metrics::CONNECTIONS.inc();
        }

        self.ensure_listener().await;
        Ok(())
    }

    /// Remove a connection; returns how many remain. History is untouched.
    pub async fn disconnect(&self, id: ConnectionId) -> usize {
        let mut state = self.state.lock().await;
        if state.connections.remove(&id).is_some() {
            metrics::CONNECTIONS.dec();
            debug!(
                channel = %self.channel,
                connection_id = %id,
                remaining = state.connections.len(),
                "connection left channel"
            );
        }
        state.connections.len()
    }

    /// Record and fan out one event.
    ///
    /// Returns `Ok(None)` when the event carries an already-seen action id;
    /// nothing is delivered and history does not grow in that case.
    pub async fn register(
        &self,
        message: EventEnvelope,
        include_sender: bool,
        sender: Option<ConnectionId>,
    ) -> Result<Option<usize>, HubError> {
        let frame = message.to_json()?;

        let mut state = self.state.lock().await;
        if state.retired {
            return Err(HubError::SessionRetired);
        }

        if let Some(action_id) = message.action_id.as_deref() {
            if !state.seen_actions.insert(action_id) {
                debug!(channel = %self.channel, action_id, "duplicate action dropped");
                metrics::DUPLICATE_ACTIONS_TOTAL.inc();
                return Ok(None);
            }
        }

        state.push_history(HistoryEntry::new(message), self.config.history_limit);

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, connection) in &state.connections {
            if !include_sender && Some(*id) == sender {
                continue;
            }
            if connection.send(frame.clone()) {
                delivered += 1;
            } else {
                dead.push(*id);
            }
        }

        // A failed send is that connection's disconnect
        if !dead.is_empty() {
            for id in &dead {
                state.connections.remove(id);
            }
            metrics::CONNECTIONS.sub(dead.len() as i64);
            debug!(
                channel = %self.channel,
                dead = dead.len(),
                active = state.connections.len(),
                "dead connections cleaned up during broadcast"
            );
        }

        Ok(Some(delivered))
    }

    /// [`register`](Self::register) collapsed to a delivery count; duplicates deliver 0.
    pub async fn register_and_broadcast(
        &self,
        message: EventEnvelope,
        include_sender: bool,
        sender: Option<ConnectionId>,
    ) -> Result<usize, HubError> {
        Ok(self
            .register(message, include_sender, sender)
            .await?
            .unwrap_or(0))
    }

    /// Handle one raw backbone payload for this channel.
    pub async fn ingest_backbone_frame(&self, bytes: &[u8]) {
        let frame = match BackboneFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "dropping undecodable backbone frame");
                return;
            }
        };

        if frame.origin == *self.node_id {
            // our own publish echoed back
            return;
        }

        match self.register(frame.message, true, None).await {
            Ok(Some(delivered)) => {
                metrics::BROADCASTS_TOTAL
                    .with_label_values(&[metrics::SOURCE_BACKBONE])
                    .inc();
                debug!(channel = %self.channel, origin = %frame.origin, delivered, "backbone event delivered");
            }
            Ok(None) => {}
            Err(HubError::SessionRetired) => {}
            Err(e) => warn!(channel = %self.channel, error = %e, "failed to deliver backbone event"),
        }
    }

    /// Drop expired history; returns the number of entries removed.
    pub async fn prune_expired(&self, ttl: Duration) -> usize {
        self.state.lock().await.prune_expired(ttl)
    }

    /// Mark the session retired if it has no connections and no history.
    pub(crate) async fn retire_if_idle(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.retired {
            return true;
        }
        if state.connections.is_empty() && state.history.is_empty() {
            state.retired = true;
        }
        state.retired
    }

    /// Retire unconditionally and drop every connection, closing their outboxes.
    pub(crate) async fn close(&self) {
        let dropped = {
            let mut state = self.state.lock().await;
            state.retired = true;
            let dropped = state.connections.len();
            state.connections.clear();
            dropped
        };
        if dropped > 0 {
            metrics::CONNECTIONS.sub(dropped as i64);
        }
        self.stop_listener().await;
    }

    /// Hold the state lock until `release` fires.
    #[cfg(test)]
    pub(crate) async fn hold_state(
        &self,
        locked: tokio::sync::oneshot::Sender<()>,
        release: tokio::sync::oneshot::Receiver<()>,
    ) {
        let _state = self.state.lock().await;
        let _ = locked.send(());
        let _ = release.await;
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn history(&self) -> Vec<EventEnvelope> {
        self.state
            .lock()
            .await
            .history
            .iter()
            .map(|entry| entry.event.clone())
            .collect()
    }

    pub async fn history_len(&self) -> usize {
        self.state.lock().await.history.len()
    }

    pub async fn has_seen_action(&self, action_id: &str) -> bool {
        self.state.lock().await.seen_actions.contains(action_id)
    }

    pub async fn listener_running(&self) -> bool {
        self.listener
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.task.is_finished())
    }

    async fn ensure_listener(self: &Arc<Self>) {
        let mut listener = self.listener.lock().await;
        if listener
            .as_ref()
            .is_some_and(|handle| !handle.task.is_finished())
        {
            return;
        }

        // Subscribe before returning so a connected socket never misses
        // events published after its join.
        let subscription = subscribe(&self.connector, &self.channel).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_listener(
            Arc::downgrade(self),
            self.channel.clone(),
            self.connector.clone(),
            self.config.clone(),
            subscription,
            shutdown_rx,
        ));

        *listener = Some(ListenerHandle {
            shutdown: shutdown_tx,
            task,
        });
    }

    /// Signal the listener and wait for it to release its subscription.
    pub(crate) async fn stop_listener(&self) {
        let handle = self.listener.lock().await.take();
        if let Some(ListenerHandle { shutdown, task }) = handle {
            let _ = shutdown.send(true);
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(channel = %self.channel, error = %e, "backbone listener ended abnormally");
                }
            }
        }
    }
}

async fn subscribe(
    connector: &BackboneConnector,
    channel: &ChannelId,
) -> Option<Box<dyn Subscription>> {
    let result = match connector.get_client().await {
        Ok(client) => client.subscribe(channel.as_str()).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(subscription) => {
            debug!(channel = %channel, "backbone subscription ready");
            Some(subscription)
        }
        Err(e) => {
            warn!(channel = %channel, error = %e, "backbone subscribe failed, delivering locally only");
            None
        }
    }
}

async fn run_listener(
    session: Weak<ChannelSession>,
    channel: ChannelId,
    connector: Arc<BackboneConnector>,
    config: Arc<HubConfig>,
    mut subscription: Option<Box<dyn Subscription>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let Some(active) = subscription.as_mut() else {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(RESUBSCRIBE_BACKOFF) => {}
            }
            subscription = subscribe(&connector, &channel).await;
            if subscription.is_some() {
                info!(channel = %channel, "backbone subscription restored");
            }
            continue;
        };

        let polled = tokio::select! {
            _ = shutdown.changed() => break,
            polled = active.next_message(config.poll_timeout) => polled,
        };

        match polled {
            Ok(Some(bytes)) => {
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.ingest_backbone_frame(&bytes).await;
            }
            Ok(None) => {
                if session.strong_count() == 0 {
                    break;
                }
                if !config.idle_sleep.is_zero() {
                    sleep(config.idle_sleep).await;
                }
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "backbone subscription failed, resubscribing");
                if let Some(broken) = subscription.take() {
                    let _ = broken.unsubscribe().await;
                }
            }
        }
    }

    if let Some(subscription) = subscription {
        if let Err(e) = subscription.unsubscribe().await {
            debug!(channel = %channel, error = %e, "backbone unsubscribe failed");
        }
    }
    debug!(channel = %channel, "backbone listener stopped");
}
