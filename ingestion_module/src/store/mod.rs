//! Relational persistence for channels, sessions, messages, the outbox and
//! the inbound audit log.
//!
//! Every write that belongs to one webhook call goes through a single
//! [`UnitOfWork`] handed out by [`ChatStore::transaction`]. The closure's
//! writes commit together when it returns `Ok` and roll back otherwise.

pub mod postgres_store;
pub mod schema;
pub mod sqlite_store;

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::channel::{ChannelRecord, ChannelUpdate};
use crate::ingestion::{ConversationMessage, InboundEvent, SessionDescriptor, StoredMessage};
use crate::outbox::{ClaimedOutboxEntry, OutboxEntry};

pub use postgres_store::PostgresChatStore;
pub use sqlite_store::SqliteChatStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("uuid error: {0}")]
    Uuid(#[from] uuid::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
    #[error("store config error: {0}")]
    Config(String),
}

/// Writes available inside one database transaction.
pub trait UnitOfWork {
    fn insert_inbound_event(&mut self, event: &InboundEvent) -> Result<(), StoreError>;

    /// Creates the session row on first use and locks it for the rest of the
    /// transaction. Returns the number of messages already stored.
    fn lock_session(&mut self, session: &SessionDescriptor) -> Result<i64, StoreError>;

    fn insert_message(&mut self, message: &ConversationMessage, seq: i64) -> Result<(), StoreError>;

    fn touch_session(
        &mut self,
        session: &SessionDescriptor,
        message_count: i64,
        last_message_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn insert_outbox(&mut self, entry: &OutboxEntry) -> Result<(), StoreError>;

    /// Loads and row-locks a channel.
    fn load_channel_for_update(&mut self, channel_id: &str) -> Result<Option<ChannelRecord>, StoreError>;

    fn save_channel(&mut self, channel_id: &str, update: &ChannelUpdate) -> Result<(), StoreError>;
}

/// Session aggregate as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub merchant_id: String,
    pub channel_id: String,
    pub session_id: String,
    pub message_count: i64,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum ChatStore {
    Sqlite(SqliteChatStore),
    Postgres(PostgresChatStore),
}

impl ChatStore {
    pub fn backend_name(&self) -> &'static str {
        match self {
            ChatStore::Sqlite(_) => "sqlite",
            ChatStore::Postgres(_) => "postgres",
        }
    }

    pub fn transaction<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T, StoreError>,
    {
        match self {
            ChatStore::Sqlite(store) => store.transaction(work),
            ChatStore::Postgres(store) => store.transaction(work),
        }
    }

    pub fn get_channel(&self, channel_id: &str) -> Result<Option<ChannelRecord>, StoreError> {
        match self {
            ChatStore::Sqlite(store) => store.get_channel(channel_id),
            ChatStore::Postgres(store) => store.get_channel(channel_id),
        }
    }

    /// Inserts a configured channel, or refreshes its binding and
    /// credentials. The connection state of an existing channel is kept.
    pub fn upsert_channel_seed(&self, channel: &ChannelRecord) -> Result<(), StoreError> {
        match self {
            ChatStore::Sqlite(store) => store.upsert_channel_seed(channel),
            ChatStore::Postgres(store) => store.upsert_channel_seed(channel),
        }
    }

    pub fn get_session(
        &self,
        channel_id: &str,
        session_id: &str,
    ) -> Result<Option<SessionSummary>, StoreError> {
        match self {
            ChatStore::Sqlite(store) => store.get_session(channel_id, session_id),
            ChatStore::Postgres(store) => store.get_session(channel_id, session_id),
        }
    }

    /// Messages of one session in `seq` order.
    pub fn list_session_messages(
        &self,
        channel_id: &str,
        session_id: &str,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        match self {
            ChatStore::Sqlite(store) => store.list_session_messages(channel_id, session_id),
            ChatStore::Postgres(store) => store.list_session_messages(channel_id, session_id),
        }
    }

    pub fn count_messages(&self, channel_id: &str) -> Result<i64, StoreError> {
        match self {
            ChatStore::Sqlite(store) => store.count_messages(channel_id),
            ChatStore::Postgres(store) => store.count_messages(channel_id),
        }
    }

    pub fn count_inbound_events(&self, channel_id: &str) -> Result<i64, StoreError> {
        match self {
            ChatStore::Sqlite(store) => store.count_inbound_events(channel_id),
            ChatStore::Postgres(store) => store.count_inbound_events(channel_id),
        }
    }

    /// Outbox rows for one aggregate, oldest first.
    pub fn list_outbox(&self, aggregate_id: &str) -> Result<Vec<OutboxEntry>, StoreError> {
        match self {
            ChatStore::Sqlite(store) => store.list_outbox(aggregate_id),
            ChatStore::Postgres(store) => store.list_outbox(aggregate_id),
        }
    }

    /// Leases up to `limit` unpublished rows to `worker_id`. A row is
    /// claimable when its previous lease is absent or expired and its
    /// backoff has elapsed.
    pub fn claim_outbox_batch(
        &self,
        worker_id: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ClaimedOutboxEntry>, StoreError> {
        match self {
            ChatStore::Sqlite(store) => store.claim_outbox_batch(worker_id, lease, limit),
            ChatStore::Postgres(store) => store.claim_outbox_batch(worker_id, lease, limit),
        }
    }

    /// Returns `false` when the claim was lost (lease expired and the row
    /// was reclaimed, or it is already published).
    pub fn mark_outbox_published(&self, id: Uuid, claim_token: Uuid) -> Result<bool, StoreError> {
        match self {
            ChatStore::Sqlite(store) => store.mark_outbox_published(id, claim_token),
            ChatStore::Postgres(store) => store.mark_outbox_published(id, claim_token),
        }
    }

    /// Gives a claimed row back after a failed publish. It becomes
    /// claimable again once `backoff` has elapsed.
    pub fn release_outbox(
        &self,
        id: Uuid,
        claim_token: Uuid,
        error: &str,
        backoff: Duration,
    ) -> Result<bool, StoreError> {
        match self {
            ChatStore::Sqlite(store) => store.release_outbox(id, claim_token, error, backoff),
            ChatStore::Postgres(store) => store.release_outbox(id, claim_token, error, backoff),
        }
    }
}

impl From<SqliteChatStore> for ChatStore {
    fn from(store: SqliteChatStore) -> Self {
        ChatStore::Sqlite(store)
    }
}

impl From<PostgresChatStore> for ChatStore {
    fn from(store: PostgresChatStore) -> Self {
        ChatStore::Postgres(store)
    }
}

pub(crate) fn duration_millis(value: Duration) -> i64 {
    i64::try_from(value.as_millis()).unwrap_or(i64::MAX)
}

pub(crate) fn offset_from(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn parse_column<T>(column: &str, value: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse::<T>()
        .map_err(|err| StoreError::Corrupt(format!("{}: {}", column, err)))
}
