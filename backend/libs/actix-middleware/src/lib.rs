//! # Actix Middleware Library
//!
//! Shared middleware for party-sync HTTP surfaces
//!
//! ## Modules
//! - `logging`: request/response access log
//! - `trace_id`: trace id extraction and propagation
//! - `rate_limit`: in-process token bucket rate limiting

pub mod logging;
pub mod rate_limit;
pub mod trace_id;

pub use logging::Logging;
pub use rate_limit::{RateLimitConfig, RateLimitMiddleware};
pub use trace_id::{get_trace_id, TraceId, TraceIdMiddleware, TRACE_ID_HEADER};
