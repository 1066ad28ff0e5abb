use crate::error::AppError;
use crate::metrics;
use actix_middleware::{RateLimitConfig, RateLimitMiddleware};
use actix_web::middleware::Condition;
use actix_web::web;

pub mod broadcast;
pub mod health;
pub mod wsroute;

/// Register every route; `rate_limit` guards the broadcast endpoint when set.
pub fn configure(cfg: &mut web::ServiceConfig, rate_limit: Option<RateLimitMiddleware>) {
    let enabled = rate_limit.is_some();
    let limiter =
        rate_limit.unwrap_or_else(|| RateLimitMiddleware::new(RateLimitConfig::default()));

    cfg.app_data(web::JsonConfig::default().error_handler(|err, _req| {
        AppError::BadRequest(err.to_string()).into()
    }))
    .route("/health", web::get().to(health::health))
    .route("/metrics", web::get().to(metrics::serve_metrics))
    .service(
        web::resource("/v1/campaigns/{campaign_id}/broadcast")
            .wrap(Condition::new(enabled, limiter))
            .route(web::post().to(broadcast::broadcast)),
    )
    // legacy alias must win over the generic scope route
    .route("/ws/campaign/{campaign_id}", web::get().to(wsroute::campaign_ws))
    .route("/ws/{scope}/{entity_id}", web::get().to(wsroute::channel_ws));
}
