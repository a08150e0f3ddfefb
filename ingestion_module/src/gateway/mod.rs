//! HTTP entry point for provider webhooks and channel management.

pub mod config;
pub mod error;
mod handlers;
pub mod rate_limit;
pub mod state;
pub mod verify;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

pub use error::GatewayError;
pub use handlers::WebhookAck;
pub use rate_limit::RateLimiter;
pub use state::GatewayState;

use handlers::{
    channel_status, connect_channel, disconnect_channel, health, ingest_webhook, ingest_webhook_event,
    verify_subscription,
};

pub fn build_router(state: Arc<GatewayState>, max_body_bytes: usize) -> Router {
    // merchant dashboards poll channel status from the browser
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .max_age(Duration::from_secs(60 * 60));

    let channels = Router::new()
        .route("/channels/:channel_id/status", get(channel_status))
        .route("/channels/:channel_id/connect", post(connect_channel))
        .route("/channels/:channel_id/disconnect", post(disconnect_channel))
        .layer(cors);

    Router::new()
        .route("/health", get(health))
        .route(
            "/webhooks/:provider/:channel_id",
            get(verify_subscription).post(ingest_webhook),
        )
        .route("/webhooks/:provider/:channel_id/:event", post(ingest_webhook_event))
        .merge(channels)
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_bytes))
}

pub async fn serve(
    state: Arc<GatewayState>,
    addr: SocketAddr,
    max_body_bytes: usize,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let app = build_router(state, max_body_bytes);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("webhook gateway listening on {}", addr);
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}
