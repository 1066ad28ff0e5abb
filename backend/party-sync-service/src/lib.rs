//! Party sync service
//!
//! Real-time broadcast hub for campaign parties and runs. Clients join a
//! channel over WebSocket, receive its recent history, and exchange JSON
//! event envelopes with everyone else on the channel. Replicas share traffic
//! through a pub/sub backbone.

pub mod config;
pub mod error;
pub mod hub;
pub mod logging;
pub mod metrics;
pub mod notifier;
pub mod routes;
pub mod state;
