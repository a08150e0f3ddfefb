#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use ingestion_module::channel::ChannelRecord;
use ingestion_module::channel_registry::ChannelRegistry;
use ingestion_module::connectors::{ChannelConnector, ProviderConnector};
use ingestion_module::gateway::{build_router, GatewayState, RateLimiter};
use ingestion_module::idempotency::{
    IdempotencyCache, IdempotencyError, IdempotencyGuard, MemoryIdempotencyCache,
};
use ingestion_module::store::{ChatStore, SqliteChatStore};

pub const PUBLIC_BASE_URL: &str = "https://hooks.example.com";

pub fn require_database_url(test_name: &str) -> Option<String> {
    dotenvy::dotenv().ok();
    match std::env::var("DATABASE_URL") {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => {
            eprintln!("Skipping {test_name}; DATABASE_URL not set.");
            None
        }
    }
}

/// Empties every table of the Postgres store at `db_url`. The schema must
/// already exist, which opening a `PostgresChatStore` guarantees.
pub fn truncate_postgres(db_url: &str) {
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .expect("tls connector");
    let mut client = postgres::Client::connect(db_url, postgres_native_tls::MakeTlsConnector::new(tls))
        .expect("connect postgres");
    client
        .batch_execute("TRUNCATE channels, sessions, messages, outbox_entries, inbound_events")
        .expect("truncate");
}

/// Cache whose backend is always down.
pub struct UnreachableCache;

#[async_trait]
impl IdempotencyCache for UnreachableCache {
    async fn set_if_absent(&self, _key: &str, _ttl: Duration) -> Result<bool, IdempotencyError> {
        Err(IdempotencyError::Unavailable("connection refused".to_string()))
    }

    async fn remove(&self, _key: &str) -> Result<(), IdempotencyError> {
        Err(IdempotencyError::Unavailable("connection refused".to_string()))
    }
}

pub struct GatewayOptions {
    pub cache: Arc<dyn IdempotencyCache>,
    pub limiter: RateLimiter,
    pub connector: Arc<dyn ChannelConnector>,
    pub admin_token: Option<String>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            cache: Arc::new(MemoryIdempotencyCache::new()),
            limiter: RateLimiter::new(Duration::from_secs(60), 0),
            connector: Arc::new(ProviderConnector::new(None).expect("connector")),
            admin_token: None,
        }
    }
}

pub struct TestGateway {
    _temp: TempDir,
    pub db_path: std::path::PathBuf,
    pub store: ChatStore,
    pub router: Router,
}

impl TestGateway {
    pub fn new(channels: &[ChannelRecord]) -> Self {
        Self::with_options(channels, GatewayOptions::default())
    }

    pub fn with_options(channels: &[ChannelRecord], options: GatewayOptions) -> Self {
        let temp = TempDir::new().expect("tempdir");
        let db_path = temp.path().join("chat.db");
        let store: ChatStore = SqliteChatStore::new(&db_path).expect("store").into();
        for channel in channels {
            store.upsert_channel_seed(channel).expect("seed channel");
        }

        let registry = ChannelRegistry::new(
            store.clone(),
            options.connector,
            Some(PUBLIC_BASE_URL.to_string()),
        );
        let guard = IdempotencyGuard::new(options.cache, Duration::from_secs(3600));
        let state = GatewayState::new(store.clone(), registry, guard, options.limiter)
            .with_admin_token(options.admin_token);
        let router = build_router(Arc::new(state), 64 * 1024);

        Self {
            _temp: temp,
            db_path,
            store,
            router,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = self.router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, body.to_vec())
    }

    pub async fn post_json(&self, uri: &str, body: &str, headers: &[(&str, &str)]) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(Body::from(body.to_string())).expect("request");
        let (status, bytes) = self.send(request).await;
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request");
        self.send(request).await
    }

    pub fn channel(&self, channel_id: &str) -> ChannelRecord {
        self.store
            .get_channel(channel_id)
            .expect("load channel")
            .expect("channel exists")
    }
}
