//! Single-file SQLite backend for local runs and tests.
//!
//! Write transactions start with `BEGIN IMMEDIATE`, which takes the database
//! write lock up front, so appends to the same session are serialized.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use crate::channel::{ChannelRecord, ChannelUpdate};
use crate::ingestion::{ConversationMessage, InboundEvent, SessionDescriptor, StoredMessage};
use crate::outbox::{ClaimedOutboxEntry, OutboxEntry};

use super::schema::SQLITE_SCHEMA;
use super::{offset_from, parse_column, SessionSummary, StoreError, UnitOfWork};

const CHANNEL_COLUMNS: &str =
    "id, provider, merchant_id, status, qr_payload, credentials_json, connect_attempt, updated_at";
const MESSAGE_COLUMNS: &str = "id, channel_id, session_id, merchant_id, provider, seq, role, text, metadata_json, provider_message_id, created_at";
const OUTBOX_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, payload_json, exchange, routing_key, created_at, published_at, attempts, last_error";

#[derive(Debug, Clone)]
pub struct SqliteChatStore {
    path: PathBuf,
}

impl SqliteChatStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { path: path.into() };
        let conn = store.open()?;
        conn.execute_batch(SQLITE_SCHEMA)?;
        Ok(store)
    }

    pub fn transaction<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T, StoreError>,
    {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = {
            let mut unit = SqliteUnitOfWork { conn: &tx };
            work(&mut unit)?
        };
        tx.commit()?;
        Ok(result)
    }

    pub fn get_channel(&self, channel_id: &str) -> Result<Option<ChannelRecord>, StoreError> {
        let conn = self.open()?;
        select_channel(&conn, channel_id)
    }

    pub fn upsert_channel_seed(&self, channel: &ChannelRecord) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO channels (id, provider, merchant_id, status, qr_payload, credentials_json, connect_attempt, updated_at)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, 0, ?6)
             ON CONFLICT(id) DO UPDATE SET
                provider = excluded.provider,
                merchant_id = excluded.merchant_id,
                credentials_json = excluded.credentials_json",
            params![
                channel.id,
                channel.provider.as_str(),
                channel.merchant_id,
                channel.status.as_str(),
                serde_json::to_string(&channel.credentials)?,
                format_datetime(channel.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_session(
        &self,
        channel_id: &str,
        session_id: &str,
    ) -> Result<Option<SessionSummary>, StoreError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT merchant_id, message_count, last_message_at
                 FROM sessions
                 WHERE channel_id = ?1 AND session_id = ?2",
                params![channel_id, session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((merchant_id, message_count, last_message_at)) => Ok(Some(SessionSummary {
                merchant_id,
                channel_id: channel_id.to_string(),
                session_id: session_id.to_string(),
                message_count,
                last_message_at: last_message_at.as_deref().map(parse_datetime).transpose()?,
            })),
            None => Ok(None),
        }
    }

    pub fn list_session_messages(
        &self,
        channel_id: &str,
        session_id: &str,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE channel_id = ?1 AND session_id = ?2
             ORDER BY seq"
        ))?;
        let rows = stmt.query_map(params![channel_id, session_id], raw_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?.into_stored()?);
        }
        Ok(messages)
    }

    pub fn count_messages(&self, channel_id: &str) -> Result<i64, StoreError> {
        let conn = self.open()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE channel_id = ?1",
            params![channel_id],
            |row| row.get(0),
        )?)
    }

    pub fn count_inbound_events(&self, channel_id: &str) -> Result<i64, StoreError> {
        let conn = self.open()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM inbound_events WHERE channel_id = ?1",
            params![channel_id],
            |row| row.get(0),
        )?)
    }

    pub fn list_outbox(&self, aggregate_id: &str) -> Result<Vec<OutboxEntry>, StoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OUTBOX_COLUMNS}
             FROM outbox_entries
             WHERE aggregate_id = ?1
             ORDER BY created_at, rowid"
        ))?;
        let rows = stmt.query_map(params![aggregate_id], raw_outbox)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    pub fn claim_outbox_batch(
        &self,
        worker_id: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ClaimedOutboxEntry>, StoreError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();
        let now_text = format_datetime(now);
        let lease_until = format_datetime(offset_from(now, lease));
        let claim_token = Uuid::new_v4();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id
                 FROM outbox_entries
                 WHERE published_at IS NULL
                   AND available_at <= ?1
                   AND (lease_expires_at IS NULL OR lease_expires_at <= ?1)
                 ORDER BY created_at, rowid
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now_text, limit], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            tx.execute(
                "UPDATE outbox_entries
                 SET claim_token = ?2,
                     claimed_by = ?3,
                     lease_expires_at = ?4,
                     attempts = attempts + 1
                 WHERE id = ?1",
                params![id, claim_token.to_string(), worker_id, lease_until],
            )?;
            let entry = tx
                .query_row(
                    &format!("SELECT {OUTBOX_COLUMNS} FROM outbox_entries WHERE id = ?1"),
                    params![id],
                    raw_outbox,
                )?
                .into_entry()?;
            claimed.push(ClaimedOutboxEntry { entry, claim_token });
        }

        tx.commit()?;
        Ok(claimed)
    }

    pub fn mark_outbox_published(&self, id: Uuid, claim_token: Uuid) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE outbox_entries
             SET published_at = ?3,
                 claim_token = NULL,
                 claimed_by = NULL,
                 lease_expires_at = NULL,
                 last_error = NULL
             WHERE id = ?1 AND claim_token = ?2 AND published_at IS NULL",
            params![id.to_string(), claim_token.to_string(), format_datetime(Utc::now())],
        )?;
        Ok(updated > 0)
    }

    pub fn release_outbox(
        &self,
        id: Uuid,
        claim_token: Uuid,
        error: &str,
        backoff: Duration,
    ) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let available_at = format_datetime(offset_from(Utc::now(), backoff));
        let updated = conn.execute(
            "UPDATE outbox_entries
             SET claim_token = NULL,
                 claimed_by = NULL,
                 lease_expires_at = NULL,
                 last_error = ?3,
                 available_at = ?4
             WHERE id = ?1 AND claim_token = ?2 AND published_at IS NULL",
            params![id.to_string(), claim_token.to_string(), error, available_at],
        )?;
        Ok(updated > 0)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }
}

struct SqliteUnitOfWork<'a> {
    conn: &'a Connection,
}

impl UnitOfWork for SqliteUnitOfWork<'_> {
    fn insert_inbound_event(&mut self, event: &InboundEvent) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO inbound_events (id, channel_id, provider, event_type, payload_json, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id.to_string(),
                event.channel_id,
                event.provider.as_str(),
                event.event_type,
                serde_json::to_string(&event.payload)?,
                format_datetime(event.received_at),
            ],
        )?;
        Ok(())
    }

    fn lock_session(&mut self, session: &SessionDescriptor) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO sessions (channel_id, session_id, merchant_id, provider, message_count, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)
             ON CONFLICT(channel_id, session_id) DO NOTHING",
            params![
                session.channel_id,
                session.session_id,
                session.merchant_id,
                session.channel.as_str(),
                format_datetime(Utc::now()),
            ],
        )?;
        Ok(self.conn.query_row(
            "SELECT message_count FROM sessions WHERE channel_id = ?1 AND session_id = ?2",
            params![session.channel_id, session.session_id],
            |row| row.get(0),
        )?)
    }

    fn insert_message(&mut self, message: &ConversationMessage, seq: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO messages
                (id, channel_id, session_id, merchant_id, provider, seq, role, text, metadata_json, provider_message_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                message.id.to_string(),
                message.channel_id,
                message.session_id,
                message.merchant_id,
                message.channel.as_str(),
                seq,
                message.role.as_str(),
                message.text,
                serde_json::to_string(&message.metadata)?,
                message.provider_message_id,
                format_datetime(message.timestamp),
            ],
        )?;
        Ok(())
    }

    fn touch_session(
        &mut self,
        session: &SessionDescriptor,
        message_count: i64,
        last_message_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE sessions
             SET message_count = ?3, last_message_at = ?4
             WHERE channel_id = ?1 AND session_id = ?2",
            params![
                session.channel_id,
                session.session_id,
                message_count,
                format_datetime(last_message_at),
            ],
        )?;
        Ok(())
    }

    fn insert_outbox(&mut self, entry: &OutboxEntry) -> Result<(), StoreError> {
        let created_at = format_datetime(entry.created_at);
        self.conn.execute(
            "INSERT INTO outbox_entries
                (id, aggregate_type, aggregate_id, event_type, payload_json, exchange, routing_key, created_at, attempts, available_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?8)",
            params![
                entry.id.to_string(),
                entry.aggregate_type,
                entry.aggregate_id,
                entry.event_type.as_str(),
                serde_json::to_string(&entry.payload)?,
                entry.exchange,
                entry.routing_key,
                created_at,
            ],
        )?;
        Ok(())
    }

    fn load_channel_for_update(&mut self, channel_id: &str) -> Result<Option<ChannelRecord>, StoreError> {
        select_channel(self.conn, channel_id)
    }

    fn save_channel(&mut self, channel_id: &str, update: &ChannelUpdate) -> Result<(), StoreError> {
        let updated = self.conn.execute(
            "UPDATE channels
             SET status = ?2, qr_payload = ?3, connect_attempt = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                channel_id,
                update.status.as_str(),
                update.qr_payload,
                update.connect_attempt,
                format_datetime(Utc::now()),
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::ChannelNotFound(channel_id.to_string()));
        }
        Ok(())
    }
}

fn select_channel(conn: &Connection, channel_id: &str) -> Result<Option<ChannelRecord>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?1"),
            params![channel_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, String>(7)?,
                ))
            },
        )
        .optional()?;

    let Some((id, provider, merchant_id, status, qr_payload, credentials_json, connect_attempt, updated_at)) =
        row
    else {
        return Ok(None);
    };
    Ok(Some(ChannelRecord {
        id,
        provider: parse_column("channels.provider", &provider)?,
        merchant_id,
        status: parse_column("channels.status", &status)?,
        qr_payload,
        credentials: serde_json::from_str(&credentials_json)?,
        connect_attempt,
        updated_at: parse_datetime(&updated_at)?,
    }))
}

struct RawMessage {
    id: String,
    channel_id: String,
    session_id: String,
    merchant_id: String,
    provider: String,
    seq: i64,
    role: String,
    text: String,
    metadata_json: String,
    provider_message_id: Option<String>,
    created_at: String,
}

fn raw_message(row: &Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok(RawMessage {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        session_id: row.get(2)?,
        merchant_id: row.get(3)?,
        provider: row.get(4)?,
        seq: row.get(5)?,
        role: row.get(6)?,
        text: row.get(7)?,
        metadata_json: row.get(8)?,
        provider_message_id: row.get(9)?,
        created_at: row.get(10)?,
    })
}

impl RawMessage {
    fn into_stored(self) -> Result<StoredMessage, StoreError> {
        Ok(StoredMessage {
            seq: self.seq,
            message: ConversationMessage {
                id: Uuid::parse_str(&self.id)?,
                merchant_id: self.merchant_id,
                channel_id: self.channel_id,
                session_id: self.session_id,
                channel: parse_column("messages.provider", &self.provider)?,
                role: parse_column("messages.role", &self.role)?,
                text: self.text,
                metadata: serde_json::from_str(&self.metadata_json)?,
                provider_message_id: self.provider_message_id,
                timestamp: parse_datetime(&self.created_at)?,
            },
        })
    }
}

struct RawOutbox {
    id: String,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    payload_json: String,
    exchange: String,
    routing_key: String,
    created_at: String,
    published_at: Option<String>,
    attempts: i32,
    last_error: Option<String>,
}

fn raw_outbox(row: &Row<'_>) -> rusqlite::Result<RawOutbox> {
    Ok(RawOutbox {
        id: row.get(0)?,
        aggregate_type: row.get(1)?,
        aggregate_id: row.get(2)?,
        event_type: row.get(3)?,
        payload_json: row.get(4)?,
        exchange: row.get(5)?,
        routing_key: row.get(6)?,
        created_at: row.get(7)?,
        published_at: row.get(8)?,
        attempts: row.get(9)?,
        last_error: row.get(10)?,
    })
}

impl RawOutbox {
    fn into_entry(self) -> Result<OutboxEntry, StoreError> {
        Ok(OutboxEntry {
            id: Uuid::parse_str(&self.id)?,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: parse_column("outbox_entries.event_type", &self.event_type)?,
            payload: serde_json::from_str(&self.payload_json)?,
            exchange: self.exchange,
            routing_key: self.routing_key,
            created_at: parse_datetime(&self.created_at)?,
            published_at: self.published_at.as_deref().map(parse_datetime).transpose()?,
            attempts: self.attempts,
            last_error: self.last_error,
        })
    }
}

fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}
