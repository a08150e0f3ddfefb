//! Publishes committed outbox rows to the message broker.
//!
//! Delivery is at least once: a row is marked published only after the
//! broker accepted it, and a dispatcher that dies mid-batch leaves its
//! claims to expire so another instance picks them up.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::outbox::{ClaimedOutboxEntry, OutboxEntry};
use crate::store::{ChatStore, StoreError};

const DEFAULT_VHOST: &str = "/";
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// One outbox row as handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub message_id: Uuid,
    pub exchange: String,
    pub routing_key: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl From<&OutboxEntry> for BrokerMessage {
    fn from(entry: &OutboxEntry) -> Self {
        Self {
            message_id: entry.id,
            exchange: entry.exchange.clone(),
            routing_key: entry.routing_key.clone(),
            event_type: entry.event_type.as_str().to_string(),
            payload: entry.payload.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("broker rejected publish ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("message was not routed by exchange {0}")]
    Unroutable(String),
}

#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    async fn publish(&self, message: &BrokerMessage) -> Result<(), PublishError>;
}

/// Publishes through the RabbitMQ management HTTP API.
#[derive(Debug, Clone)]
pub struct HttpBrokerPublisher {
    client: reqwest::Client,
    base_url: String,
    vhost: String,
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    routed: bool,
}

impl HttpBrokerPublisher {
    pub fn new(
        base_url: &str,
        vhost: Option<&str>,
        username: &str,
        password: &str,
    ) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder().timeout(PUBLISH_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            vhost: vhost
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or(DEFAULT_VHOST)
                .to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    fn publish_url(&self, exchange: &str) -> String {
        format!(
            "{}/api/exchanges/{}/{}/publish",
            self.base_url,
            urlencoding::encode(&self.vhost),
            urlencoding::encode(exchange)
        )
    }
}

#[async_trait]
impl BrokerPublisher for HttpBrokerPublisher {
    async fn publish(&self, message: &BrokerMessage) -> Result<(), PublishError> {
        let body = json!({
            "properties": {
                "delivery_mode": 2,
                "message_id": message.message_id.to_string(),
                "content_type": "application/json",
                "type": message.event_type,
            },
            "routing_key": message.routing_key,
            "payload": message.payload.to_string(),
            "payload_encoding": "string",
        });
        let response = self
            .client
            .post(self.publish_url(&message.exchange))
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let reply: PublishResponse = response.json().await?;
        if !reply.routed {
            return Err(PublishError::Unroutable(message.exchange.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_id: String,
    pub batch_size: usize,
    /// How long a claimed row stays reserved for this worker.
    pub lease: Duration,
    pub poll_interval: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("dispatcher-{}", Uuid::new_v4()),
            batch_size: 50,
            lease: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl DispatcherConfig {
    /// Exponential backoff after `attempts` failed publishes, capped.
    pub fn backoff_for(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 20) as u32;
        self.base_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    /// Published to the broker, but the lease had already moved on.
    pub lost: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub struct OutboxDispatcher {
    store: ChatStore,
    publisher: Arc<dyn BrokerPublisher>,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(store: ChatStore, publisher: Arc<dyn BrokerPublisher>, config: DispatcherConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Claims one batch and publishes it.
    pub async fn run_once(&self) -> Result<DispatchReport, DispatchError> {
        let store = self.store.clone();
        let worker_id = self.config.worker_id.clone();
        let lease = self.config.lease;
        let limit = self.config.batch_size.max(1);
        let batch = tokio::task::spawn_blocking(move || store.claim_outbox_batch(&worker_id, lease, limit))
            .await??;

        let mut report = DispatchReport {
            claimed: batch.len(),
            ..DispatchReport::default()
        };
        for claimed in batch {
            self.dispatch(claimed, &mut report).await?;
        }
        if report.claimed > 0 {
            info!(
                "outbox batch worker={} claimed={} published={} failed={} lost={}",
                self.config.worker_id, report.claimed, report.published, report.failed, report.lost
            );
        }
        Ok(report)
    }

    async fn dispatch(
        &self,
        claimed: ClaimedOutboxEntry,
        report: &mut DispatchReport,
    ) -> Result<(), DispatchError> {
        let ClaimedOutboxEntry { entry, claim_token } = claimed;
        let message = BrokerMessage::from(&entry);
        let store = self.store.clone();

        match self.publisher.publish(&message).await {
            Ok(()) => {
                let marked = tokio::task::spawn_blocking(move || {
                    store.mark_outbox_published(entry.id, claim_token)
                })
                .await??;
                if marked {
                    report.published += 1;
                    debug!("outbox published id={} exchange={}", message.message_id, message.exchange);
                } else {
                    report.lost += 1;
                    warn!(
                        "outbox claim lost after publish id={}, consumers may see it twice",
                        message.message_id
                    );
                }
            }
            Err(err) => {
                report.failed += 1;
                let backoff = self.config.backoff_for(entry.attempts);
                warn!(
                    "outbox publish failed id={} attempts={} retry_in={:?}: {}",
                    entry.id, entry.attempts, backoff, err
                );
                let reason = err.to_string();
                let released = tokio::task::spawn_blocking(move || {
                    store.release_outbox(entry.id, claim_token, &reason, backoff)
                })
                .await??;
                if !released {
                    debug!("outbox row already reclaimed id={}", message.message_id);
                }
            }
        }
        Ok(())
    }

    /// Polls until `shutdown` resolves. Shutdown is checked between batches,
    /// so a backlog never holds it up for more than one batch. Store errors
    /// are logged and retried on the next tick.
    pub async fn run(&self, shutdown: impl Future<Output = ()> + Send) {
        tokio::pin!(shutdown);
        info!(
            "outbox dispatcher started worker={} batch_size={}",
            self.config.worker_id, self.config.batch_size
        );
        loop {
            let pause = match self.run_once().await {
                Ok(report) if report.claimed > 0 => Duration::ZERO,
                Ok(_) => self.config.poll_interval,
                Err(err) => {
                    error!("outbox dispatch error: {}", err);
                    self.config.poll_interval
                }
            };
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!("outbox dispatcher stopped worker={}", self.config.worker_id);
    }
}
