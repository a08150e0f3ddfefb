use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::channel::{ChannelCredentials, ChannelRecord, Provider};
use crate::dispatcher::DispatcherConfig;
use crate::idempotency::DEFAULT_IDEMPOTENCY_TTL;
use crate::store::{ChatStore, PostgresChatStore, SqliteChatStore, StoreError};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 9100;
const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;
const DEFAULT_SQLITE_PATH: &str = "chat.db";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("GATEWAY_CONFIG_PATH not set and gateway.toml not found")]
    NotFound,
    #[error("failed to read gateway config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse gateway config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid gateway config: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Default)]
pub struct GatewayConfigFile {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    #[serde(default)]
    pub channels: Vec<ChannelSeedConfig>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Externally reachable base URL, used to build webhook URLs.
    pub public_base_url: Option<String>,
    pub max_body_bytes: Option<usize>,
    /// Bearer token required by the channel management endpoints.
    pub admin_token: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct StorageConfig {
    pub backend: Option<String>,
    pub sqlite_path: Option<PathBuf>,
    pub db_url: Option<String>,
    #[serde(default)]
    pub allow_invalid_certs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Sqlite,
    Postgres,
}

#[derive(Debug, Deserialize, Default)]
pub struct IdempotencyConfig {
    pub ttl_secs: Option<u64>,
    pub redis_url: Option<String>,
    pub op_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RateLimitConfig {
    pub window_secs: Option<u64>,
    pub max_requests: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ProvidersConfig {
    pub telegram_api_base: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct DispatcherSection {
    pub broker_url: Option<String>,
    pub vhost: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub worker_id: Option<String>,
    pub batch_size: Option<usize>,
    pub lease_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub max_backoff_secs: Option<u64>,
}

/// A channel declared in the config file and upserted at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct ChannelSeedConfig {
    pub id: String,
    pub provider: String,
    pub merchant_id: String,
    #[serde(default)]
    pub credentials: ChannelCredentials,
}

impl ChannelSeedConfig {
    pub fn to_record(&self) -> Result<ChannelRecord, ConfigError> {
        let provider: Provider = self
            .provider
            .parse()
            .map_err(|err: String| ConfigError::Invalid(format!("channel {}: {}", self.id, err)))?;
        if self.id.trim().is_empty() || self.merchant_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "channel seeds need an id and a merchant_id".to_string(),
            ));
        }
        Ok(ChannelRecord::new(
            self.id.trim(),
            provider,
            self.merchant_id.trim(),
            self.credentials.clone(),
        ))
    }
}

pub fn resolve_gateway_config_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var("GATEWAY_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    let cwd = env::current_dir()?;
    let direct = cwd.join("gateway.toml");
    if direct.exists() {
        return Ok(direct);
    }

    Err(ConfigError::NotFound)
}

/// Reads the config file and applies environment overrides.
pub fn load_gateway_config(path: &Path) -> Result<GatewayConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut config = toml::from_str::<GatewayConfigFile>(&content)?;
    config.apply_env_overrides();
    Ok(config)
}

fn env_value(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl GatewayConfigFile {
    pub fn apply_env_overrides(&mut self) {
        if let Some(host) = env_value("GATEWAY_HOST") {
            self.server.host = Some(host);
        }
        if let Some(port) = env_value("GATEWAY_PORT").and_then(|value| value.parse::<u16>().ok()) {
            self.server.port = Some(port);
        }
        if let Some(db_url) = env_value("DATABASE_URL") {
            self.storage.db_url = Some(db_url);
        }
        if let Some(redis_url) = env_value("REDIS_URL") {
            self.idempotency.redis_url = Some(redis_url);
        }
        if let Some(broker_url) = env_value("BROKER_URL") {
            self.dispatcher.broker_url = Some(broker_url);
        }
        if let Some(worker_id) = env_value("WORKER_INSTANCE_ID") {
            self.dispatcher.worker_id = Some(worker_id);
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = self.server.host.as_deref().unwrap_or(DEFAULT_HOST);
        let port = self.server.port.unwrap_or(DEFAULT_PORT);
        format!("{}:{}", host, port)
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid listen address {}:{}", host, port)))
    }

    pub fn max_body_bytes(&self) -> usize {
        self.server
            .max_body_bytes
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_BODY_BYTES)
    }

    pub fn admin_token(&self) -> Option<String> {
        self.server
            .admin_token
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    pub fn channel_seeds(&self) -> Result<Vec<ChannelRecord>, ConfigError> {
        self.channels.iter().map(ChannelSeedConfig::to_record).collect()
    }

    pub fn idempotency_ttl(&self) -> Duration {
        self.idempotency
            .ttl_secs
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_IDEMPOTENCY_TTL)
    }

    pub fn redis_op_timeout(&self) -> Option<Duration> {
        self.idempotency.op_timeout_ms.map(Duration::from_millis)
    }

    /// `(window, max_requests)` for the per-channel limiter.
    pub fn rate_limit(&self) -> (Duration, u32) {
        (
            Duration::from_secs(self.rate_limit.window_secs.unwrap_or(60).max(1)),
            self.rate_limit.max_requests.unwrap_or(600),
        )
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let section = &self.dispatcher;
        let defaults = DispatcherConfig::default();
        DispatcherConfig {
            worker_id: section.worker_id.clone().unwrap_or(defaults.worker_id),
            batch_size: section.batch_size.filter(|value| *value > 0).unwrap_or(defaults.batch_size),
            lease: section.lease_secs.map(Duration::from_secs).unwrap_or(defaults.lease),
            poll_interval: section
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            base_backoff: defaults.base_backoff,
            max_backoff: section
                .max_backoff_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_backoff),
        }
    }
}

impl StorageConfig {
    /// Explicit `backend` wins; otherwise a configured `db_url` selects
    /// Postgres.
    pub fn backend(&self) -> Result<StorageBackend, ConfigError> {
        match self.backend.as_deref().map(str::trim) {
            Some("sqlite") => Ok(StorageBackend::Sqlite),
            Some("postgres") | Some("postgresql") => Ok(StorageBackend::Postgres),
            Some(other) if !other.is_empty() => {
                Err(ConfigError::Invalid(format!("unknown storage backend: {}", other)))
            }
            _ if self.db_url.is_some() => Ok(StorageBackend::Postgres),
            _ => Ok(StorageBackend::Sqlite),
        }
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.sqlite_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SQLITE_PATH))
    }

    /// Opens the configured backend and ensures its schema. Blocking.
    pub fn open_store(&self) -> Result<ChatStore, StoreError> {
        let backend = self
            .backend()
            .map_err(|err| StoreError::Config(err.to_string()))?;
        match backend {
            StorageBackend::Sqlite => Ok(SqliteChatStore::new(self.sqlite_path())?.into()),
            StorageBackend::Postgres => {
                let db_url = self
                    .db_url
                    .as_deref()
                    .ok_or_else(|| StoreError::Config("postgres backend needs db_url or DATABASE_URL".to_string()))?;
                Ok(PostgresChatStore::new(db_url, self.allow_invalid_certs)?.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FULL_CONFIG: &str = r#"
[server]
host = "127.0.0.1"
port = 9200
public_base_url = "https://hooks.example.com/"
admin_token = "  "

[storage]
backend = "sqlite"
sqlite_path = "/var/lib/chat/chat.db"

[idempotency]
ttl_secs = 120
op_timeout_ms = 50

[rate_limit]
window_secs = 10
max_requests = 5

[dispatcher]
broker_url = "http://rabbit:15672"
batch_size = 20
lease_secs = 30

[[channels]]
id = "tg-main"
provider = "telegram"
merchant_id = "m1"
credentials = { bot_token = "123:abc", webhook_secret = "s3cret" }

[[channels]]
id = "wa-qr"
provider = "whatsapp-qr"
merchant_id = "m2"
"#;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("tempfile");
        file.write_all(content.as_bytes()).expect("write");
        file
    }

    fn clear_env() {
        for name in [
            "GATEWAY_HOST",
            "GATEWAY_PORT",
            "DATABASE_URL",
            "REDIS_URL",
            "BROKER_URL",
            "WORKER_INSTANCE_ID",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn parses_sections_and_channel_seeds() {
        clear_env();
        let file = write_config(FULL_CONFIG);
        let config = load_gateway_config(file.path()).unwrap();

        assert_eq!(config.listen_addr().unwrap().to_string(), "127.0.0.1:9200");
        assert_eq!(config.storage.backend().unwrap(), StorageBackend::Sqlite);
        assert_eq!(config.storage.sqlite_path(), PathBuf::from("/var/lib/chat/chat.db"));
        assert_eq!(config.idempotency_ttl(), Duration::from_secs(120));
        assert_eq!(config.redis_op_timeout(), Some(Duration::from_millis(50)));
        assert_eq!(config.rate_limit(), (Duration::from_secs(10), 5));
        assert_eq!(config.admin_token(), None);

        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.batch_size, 20);
        assert_eq!(dispatcher.lease, Duration::from_secs(30));

        let seeds = config.channel_seeds().unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].provider, Provider::Telegram);
        assert_eq!(seeds[0].credentials.bot_token.as_deref(), Some("123:abc"));
        assert_eq!(seeds[1].provider, Provider::WhatsAppQr);
        assert_eq!(seeds[1].merchant_id, "m2");
    }

    #[test]
    #[serial]
    fn environment_overrides_file_values() {
        clear_env();
        env::set_var("GATEWAY_PORT", "9300");
        env::set_var("DATABASE_URL", "postgres://chat@localhost/chat");
        env::set_var("WORKER_INSTANCE_ID", "dispatcher-7");
        let file = write_config("[server]\nport = 9200\n");
        let config = load_gateway_config(file.path()).unwrap();
        clear_env();

        assert_eq!(config.server.port, Some(9300));
        assert_eq!(config.storage.backend().unwrap(), StorageBackend::Postgres);
        assert_eq!(config.dispatcher_config().worker_id, "dispatcher-7");
    }

    #[test]
    #[serial]
    fn empty_file_uses_defaults() {
        clear_env();
        let file = write_config("");
        let config = load_gateway_config(file.path()).unwrap();
        assert_eq!(config.listen_addr().unwrap().port(), DEFAULT_PORT);
        assert_eq!(config.max_body_bytes(), DEFAULT_MAX_BODY_BYTES);
        assert_eq!(config.idempotency_ttl(), DEFAULT_IDEMPOTENCY_TTL);
        assert_eq!(config.storage.backend().unwrap(), StorageBackend::Sqlite);
        assert!(config.channel_seeds().unwrap().is_empty());
    }

    #[test]
    fn unknown_provider_in_seed_is_rejected() {
        let seed = ChannelSeedConfig {
            id: "x".to_string(),
            provider: "carrier-pigeon".to_string(),
            merchant_id: "m1".to_string(),
            credentials: ChannelCredentials::default(),
        };
        assert!(matches!(seed.to_record(), Err(ConfigError::Invalid(_))));
    }
}
