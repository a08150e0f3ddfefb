use std::sync::Arc;

use tokio::task;
use tracing::{info, warn};

use ingestion_module::channel_registry::ChannelRegistry;
use ingestion_module::connectors::ProviderConnector;
use ingestion_module::gateway::config::{load_gateway_config, resolve_gateway_config_path, GatewayConfigFile};
use ingestion_module::gateway::{self, GatewayState, RateLimiter};
use ingestion_module::idempotency::{
    IdempotencyCache, IdempotencyGuard, MemoryIdempotencyCache, RedisIdempotencyCache,
};
use ingestion_module::BoxError;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt().with_target(false).init();
    dotenvy::dotenv().ok();

    let config_path = resolve_gateway_config_path()?;
    let config: GatewayConfigFile = load_gateway_config(&config_path)?;
    let addr = config.listen_addr()?;
    let seeds = config.channel_seeds()?;

    let storage = config.storage.clone();
    let store = task::spawn_blocking(move || storage.open_store())
        .await
        .map_err(|err| -> BoxError { err.into() })??;
    let seeded = seeds.len();
    let seed_store = store.clone();
    task::spawn_blocking(move || {
        seeds
            .iter()
            .try_for_each(|channel| seed_store.upsert_channel_seed(channel))
    })
    .await
    .map_err(|err| -> BoxError { err.into() })??;

    let cache: Arc<dyn IdempotencyCache> = match config.idempotency.redis_url.as_deref() {
        Some(redis_url) => Arc::new(RedisIdempotencyCache::new(redis_url, config.redis_op_timeout())?),
        None => {
            warn!("REDIS_URL not configured, deduplicating in process memory only");
            Arc::new(MemoryIdempotencyCache::new())
        }
    };
    let guard = IdempotencyGuard::new(cache, config.idempotency_ttl());

    let connector = ProviderConnector::new(config.providers.telegram_api_base.as_deref())?;
    let registry = ChannelRegistry::new(
        store.clone(),
        Arc::new(connector),
        config.server.public_base_url.clone(),
    );
    let (window, max_requests) = config.rate_limit();
    let state = Arc::new(
        GatewayState::new(store.clone(), registry, guard, RateLimiter::new(window, max_requests))
            .with_admin_token(config.admin_token()),
    );

    info!(
        "webhook gateway config path={}, addr={}, storage={}, channels_seeded={}, db_url=***",
        config_path.display(),
        addr,
        store.backend_name(),
        seeded
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("webhook gateway shutting down");
    };
    gateway::serve(state, addr, config.max_body_bytes(), shutdown).await?;
    Ok(())
}
