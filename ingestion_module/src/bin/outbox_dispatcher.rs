use std::sync::Arc;

use tokio::task;
use tracing::info;

use ingestion_module::dispatcher::{HttpBrokerPublisher, OutboxDispatcher};
use ingestion_module::gateway::config::{load_gateway_config, resolve_gateway_config_path};
use ingestion_module::BoxError;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt().with_target(false).init();
    dotenvy::dotenv().ok();

    let config_path = resolve_gateway_config_path()?;
    let config = load_gateway_config(&config_path)?;
    let section = &config.dispatcher;
    let broker_url = section
        .broker_url
        .as_deref()
        .ok_or("dispatcher.broker_url or BROKER_URL must be set")?;
    let publisher = HttpBrokerPublisher::new(
        broker_url,
        section.vhost.as_deref(),
        section.username.as_deref().unwrap_or("guest"),
        section.password.as_deref().unwrap_or("guest"),
    )?;

    let storage = config.storage.clone();
    let store = task::spawn_blocking(move || storage.open_store())
        .await
        .map_err(|err| -> BoxError { err.into() })??;

    let dispatcher_config = config.dispatcher_config();
    info!(
        "outbox dispatcher config path={}, worker={}, storage={}, broker={}",
        config_path.display(),
        dispatcher_config.worker_id,
        store.backend_name(),
        broker_url
    );

    let dispatcher = OutboxDispatcher::new(store, Arc::new(publisher), dispatcher_config);
    dispatcher
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    Ok(())
}
