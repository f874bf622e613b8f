pub mod hub;
pub mod routes;
pub mod state;

pub use hub::{BroadcastHub, Outbound};

use anyhow::Context;
use axum::Router;
use coinpulse_core::CoinpulseConfig;
use coinpulse_data::{Cache, HttpUpstream, RateLimiter, UpstreamClient};
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the Axum application router.
pub fn build_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::ws_routes())
        .nest("/api", routes::api_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Wire the cache, limiter, upstream client and hub from configuration.
pub fn build_state(config: Arc<CoinpulseConfig>) -> anyhow::Result<Arc<AppState>> {
    let upstream = HttpUpstream::new(&config.upstream).context("building upstream HTTP client")?;
    let cache = Arc::new(Cache::new());
    let limiter = Arc::new(RateLimiter::new(&config.rate_limits));
    let client = UpstreamClient::new(Arc::new(upstream), cache.clone(), limiter, config.clone());
    let hub = BroadcastHub::new(Arc::new(client), config.clone());
    Ok(Arc::new(AppState::new(hub, cache, config)))
}

/// Start the sync server and run until Ctrl-C.
pub async fn start_server(config: Arc<CoinpulseConfig>) -> anyhow::Result<()> {
    let app_state = build_state(config.clone())?;
    let sweeper = app_state
        .cache
        .spawn_sweeper(Duration::from_secs(config.cache.sweep_interval_secs));

    let app = build_router(app_state.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!(
        "Sync server listening on {} ({} topics)",
        config.bind,
        config.topics.len()
    );

    let hub = app_state.hub.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
            // Ask open sockets to close so the server can drain.
            hub.close();
        })
        .await?;

    app_state.cache.close();
    let _ = sweeper.await;
    Ok(())
}
