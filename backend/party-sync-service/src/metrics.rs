use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

pub const SOURCE_SOCKET: &str = "socket";
pub const SOURCE_BACKBONE: &str = "backbone";
pub const SOURCE_HTTP: &str = "http";

pub const REASON_CONNECTION_LIMIT: &str = "connection_limit";
pub const REASON_CHANNEL_LIMIT: &str = "channel_limit";
pub const REASON_UNAUTHORIZED: &str = "unauthorized";

pub static CHANNELS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("party_sync_channels", "Live channel sessions")
        .expect("failed to create party_sync_channels");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register party_sync_channels");
    gauge
});

pub static CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("party_sync_connections", "Open WebSocket connections")
        .expect("failed to create party_sync_connections");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register party_sync_connections");
    gauge
});

pub static BROADCASTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "party_sync_broadcasts_total",
            "Events fanned out to local sockets, by producer",
        ),
        &["source"],
    )
    .expect("failed to create party_sync_broadcasts_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register party_sync_broadcasts_total");
    counter
});

pub static DUPLICATE_ACTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "party_sync_duplicate_actions_total",
        "Events dropped because their action id was already seen",
    )
    .expect("failed to create party_sync_duplicate_actions_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register party_sync_duplicate_actions_total");
    counter
});

pub static BACKBONE_PUBLISH_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "party_sync_backbone_publish_failures_total",
        "Backbone publishes that failed; the event was delivered locally only",
    )
    .expect("failed to create party_sync_backbone_publish_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register party_sync_backbone_publish_failures_total");
    counter
});

pub static REJECTED_CONNECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "party_sync_rejected_connections_total",
            "WebSocket connections refused, by reason",
        ),
        &["reason"],
    )
    .expect("failed to create party_sync_rejected_connections_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register party_sync_rejected_connections_total");
    counter
});

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
