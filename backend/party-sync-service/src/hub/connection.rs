use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// Unique identifier for a channel connection
///
/// Used as the sender identity when a client frame is fanned out and for
/// precise removal when the socket closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Session-side handle of one socket
///
/// The session only ever pushes serialized frames into the outbox; the task
/// serving the socket drains it. A failed push means the socket task is gone.
pub struct Connection {
    id: ConnectionId,
    outbox: UnboundedSender<String>,
}

impl Connection {
    pub fn new() -> (Self, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        (
            Self {
                id: ConnectionId::new(),
                outbox: tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, frame: String) -> bool {
        self.outbox.send(frame).is_ok()
    }
}

/// WebSocket close frame sent by the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

// Close reasons are limited to 123 bytes on the wire
const MAX_REASON_LEN: usize = 123;

impl CloseFrame {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;

    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > MAX_REASON_LEN {
            let mut cut = MAX_REASON_LEN;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason.truncate(cut);
        }
        Self { code, reason }
    }

    pub fn normal() -> Self {
        Self::new(Self::NORMAL, "")
    }

    pub fn at_capacity() -> Self {
        Self::new(Self::GOING_AWAY, "Channel at capacity")
    }

    pub fn channel_limit() -> Self {
        Self::new(Self::GOING_AWAY, "Channel limit reached")
    }

    pub fn shutting_down() -> Self {
        Self::new(Self::NORMAL, "Server shutting down")
    }

    pub fn invalid_payload(detail: impl fmt::Display) -> Self {
        Self::new(Self::UNSUPPORTED_DATA, format!("Invalid payload: {detail}"))
    }

    pub fn unauthorized() -> Self {
        Self::new(Self::POLICY_VIOLATION, "Unauthorized")
    }

    pub fn internal() -> Self {
        Self::new(Self::INTERNAL_ERROR, "Internal error")
    }
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("unsupported {0} frame")]
    UnsupportedFrame(&'static str),

    #[error("socket closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Full-duplex text socket as seen by the hub
///
/// Implemented over actix-ws for real clients and over in-memory channels in
/// tests. Futures are not `Send` because actix payload streams are not.
#[async_trait(?Send)]
pub trait ClientSocket {
    /// Next text frame; `None` once the peer closed the socket.
    async fn recv(&mut self) -> Option<Result<String, SocketError>>;

    async fn send(&mut self, frame: String) -> Result<(), SocketError>;

    async fn ping(&mut self) -> Result<(), SocketError>;

    async fn close(&mut self, frame: CloseFrame);
}
