use actix_middleware::{Logging, RateLimitMiddleware, TraceIdMiddleware};
use actix_web::{web, App, HttpServer};
use party_sync_service::{
    config::Config,
    error::AppError,
    hub::{self, PartyHub},
    logging, routes,
    state::AppState,
};
use redis_utils::BackboneConnector;
use std::sync::Arc;
use tokio::sync::watch;

#[actix_web::main]
async fn main() -> Result<(), AppError> {
    let cfg = Arc::new(Config::from_env()?);
    logging::init_tracing(&cfg.log_format);

    let connector = Arc::new(BackboneConnector::new(cfg.redis_url.clone()));
    tracing::info!(backbone = %connector.describe(), "starting party-sync-service");

    let party_hub = Arc::new(PartyHub::new(cfg.hub_config(), connector));
    party_hub.start().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = hub::spawn_history_sweeper(party_hub.clone(), shutdown_rx);

    let rate_limit = cfg
        .rate_limit_enabled
        .then(|| RateLimitMiddleware::new(cfg.rate_limit_config()));
    let state = AppState::new(party_hub.clone(), cfg.clone());

    let bind_addr = cfg.bind_addr();
    tracing::info!(%bind_addr, node_id = %party_hub.node_id(), "listening");

    HttpServer::new(move || {
        let rate_limit = rate_limit.clone();
        App::new()
            .wrap(actix_cors::Cors::permissive())
            .wrap(Logging)
            .wrap(TraceIdMiddleware)
            .app_data(web::Data::new(state.clone()))
            .configure(|cfg| routes::configure(cfg, rate_limit))
    })
    .bind(&bind_addr)
    .map_err(|e| AppError::StartServer(format!("bind {bind_addr}: {e}")))?
    .run()
    .await
    .map_err(|e| AppError::StartServer(format!("run: {e}")))?;

    tracing::info!("http server stopped, draining hub");
    let _ = shutdown_tx.send(true);
    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }
    party_hub.shutdown().await;

    Ok(())
}
