//! Short-lived deduplication of provider message ids.
//!
//! The guard fails open: when the cache cannot be reached the event is
//! treated as new. Downstream consumers already tolerate at-least-once
//! delivery, while a blocked webhook makes the provider retry indefinitely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::channel::Provider;

pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("cache operation timed out")]
    Timeout,
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Key-value store with an atomic "set if absent, with TTL" primitive.
#[async_trait]
pub trait IdempotencyCache: Send + Sync {
    /// Returns `true` when the key was absent and is now recorded.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, IdempotencyError>;
    async fn remove(&self, key: &str) -> Result<(), IdempotencyError>;
}

/// Stable fingerprint over the fields that identify one provider message.
pub fn build_idempotency_key(
    provider: Provider,
    channel_id: &str,
    merchant_id: &str,
    provider_message_id: &str,
) -> String {
    let mut hasher = Sha256::new();
    for part in [
        provider.as_str(),
        channel_id.trim(),
        merchant_id.trim(),
        provider_message_id.trim(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update(b"\n");
    }
    format!("idem:{}", hex::encode(hasher.finalize()))
}

/// Returns `true` when `key` was already seen inside the window. Cache
/// failures count as "not seen".
pub async fn prevent_duplicates(cache: &dyn IdempotencyCache, key: &str, ttl: Duration) -> bool {
    match cache.set_if_absent(key, ttl).await {
        Ok(inserted) => !inserted,
        Err(err) => {
            warn!("idempotency cache unavailable, accepting event key={}: {}", key, err);
            false
        }
    }
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    cache: Arc<dyn IdempotencyCache>,
    ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(cache: Arc<dyn IdempotencyCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    /// `true` means duplicate: reject. Otherwise the key is now recorded.
    pub async fn check_and_mark(&self, key: &str) -> bool {
        prevent_duplicates(self.cache.as_ref(), key, self.ttl).await
    }

    /// Forgets a key after the event it guarded failed to persist, so the
    /// provider's retry is processed again.
    pub async fn release(&self, key: &str) {
        if let Err(err) = self.cache.remove(key).await {
            warn!("failed to release idempotency key={}: {}", key, err);
        }
    }
}

const MEMORY_PRUNE_THRESHOLD: usize = 10_000;

/// In-process cache for single-instance deployments and tests. Expired keys
/// are swept only once the map reaches its pruning watermark.
pub struct MemoryIdempotencyCache {
    state: Mutex<MemoryState>,
    prune_threshold: usize,
}

struct MemoryState {
    entries: HashMap<String, Instant>,
    prune_at: usize,
}

impl Default for MemoryIdempotencyCache {
    fn default() -> Self {
        Self::with_prune_threshold(MEMORY_PRUNE_THRESHOLD)
    }
}

impl MemoryIdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prune_threshold(prune_threshold: usize) -> Self {
        let prune_threshold = prune_threshold.max(1);
        Self {
            state: Mutex::new(MemoryState {
                entries: HashMap::new(),
                prune_at: prune_threshold,
            }),
            prune_threshold,
        }
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .map(|state| state.entries.values().filter(|expiry| **expiry > now).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyCache for MemoryIdempotencyCache {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, IdempotencyError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| IdempotencyError::Unavailable("cache lock poisoned".to_string()))?;
        let now = Instant::now();
        if state.entries.get(key).is_some_and(|expiry| *expiry > now) {
            return Ok(false);
        }
        if state.entries.len() >= state.prune_at {
            state.entries.retain(|_, expiry| *expiry > now);
            // live keys alone can fill the map; sweep again at twice that size
            state.prune_at = self.prune_threshold.max(state.entries.len() * 2);
        }
        state.entries.insert(key.to_string(), now + ttl);
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<(), IdempotencyError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| IdempotencyError::Unavailable("cache lock poisoned".to_string()))?;
        state.entries.remove(key);
        Ok(())
    }
}

/// Redis-backed cache shared by all gateway instances. The connection is
/// established lazily so the gateway starts even when Redis is down.
pub struct RedisIdempotencyCache {
    client: redis::Client,
    connection: tokio::sync::Mutex<Option<ConnectionManager>>,
    op_timeout: Duration,
}

impl RedisIdempotencyCache {
    pub fn new(redis_url: &str, op_timeout: Option<Duration>) -> Result<Self, IdempotencyError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            connection: tokio::sync::Mutex::new(None),
            op_timeout: op_timeout.unwrap_or(DEFAULT_OP_TIMEOUT),
        })
    }

    async fn manager(&self) -> Result<ConnectionManager, IdempotencyError> {
        let mut guard = self.connection.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }
        let manager = tokio::time::timeout(
            self.op_timeout,
            ConnectionManager::new(self.client.clone()),
        )
        .await
        .map_err(|_| IdempotencyError::Timeout)??;
        debug!("idempotency redis connection established");
        *guard = Some(manager.clone());
        Ok(manager)
    }
}

#[async_trait]
impl IdempotencyCache for RedisIdempotencyCache {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, IdempotencyError> {
        let mut conn = self.manager().await?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(1).arg("NX").arg("PX").arg(ttl_ms);
        let reply: Option<String> = tokio::time::timeout(self.op_timeout, cmd.query_async(&mut conn))
            .await
            .map_err(|_| IdempotencyError::Timeout)??;
        Ok(reply.is_some())
    }

    async fn remove(&self, key: &str) -> Result<(), IdempotencyError> {
        let mut conn = self.manager().await?;
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let _: i64 = tokio::time::timeout(self.op_timeout, cmd.query_async(&mut conn))
            .await
            .map_err(|_| IdempotencyError::Timeout)??;
        Ok(())
    }
}
