use std::time::Duration;

use chrono::{DateTime, Utc};
use postgres::Row;
use postgres_native_tls::MakeTlsConnector;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use tracing::error;
use uuid::Uuid;

use crate::channel::{ChannelRecord, ChannelUpdate};
use crate::ingestion::{ConversationMessage, InboundEvent, SessionDescriptor, StoredMessage};
use crate::outbox::{ClaimedOutboxEntry, OutboxEntry};

use super::schema::POSTGRES_SCHEMA;
use super::{duration_millis, parse_column, SessionSummary, StoreError, UnitOfWork};

type PgPool = Pool<PostgresConnectionManager<MakeTlsConnector>>;

const CHANNEL_COLUMNS: &str =
    "id, provider, merchant_id, status, qr_payload, credentials_json, connect_attempt, updated_at";
const MESSAGE_COLUMNS: &str = "id, channel_id, session_id, merchant_id, provider, seq, role, text, metadata_json, provider_message_id, created_at";
const OUTBOX_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, payload_json, exchange, routing_key, created_at, published_at, attempts, last_error";

/// Logs the underlying connection error; r2d2 otherwise only reports a
/// timeout to the caller.
#[derive(Debug)]
struct LoggingErrorHandler;

impl r2d2::HandleError<postgres::Error> for LoggingErrorHandler {
    fn handle_error(&self, err: postgres::Error) {
        error!("postgres connection pool error: {:?}", err);
    }
}

#[derive(Clone)]
pub struct PostgresChatStore {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresChatStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresChatStore")
            .field("max_size", &self.pool.max_size())
            .finish()
    }
}

impl PostgresChatStore {
    pub fn new(db_url: &str, allow_invalid_certs: bool) -> Result<Self, StoreError> {
        let config: postgres::Config = db_url.parse()?;
        let mut tls_builder = native_tls::TlsConnector::builder();
        if allow_invalid_certs {
            tls_builder.danger_accept_invalid_certs(true);
            tls_builder.danger_accept_invalid_hostnames(true);
        }
        let tls_connector = tls_builder
            .build()
            .map_err(|err| StoreError::Config(err.to_string()))?;
        let tls = MakeTlsConnector::new(tls_connector);

        let manager = PostgresConnectionManager::new(config, tls);
        let pool = Pool::builder()
            .max_size(8)
            .idle_timeout(Some(Duration::from_secs(300)))
            .error_handler(Box::new(LoggingErrorHandler))
            .build(manager)?;
        let store = Self { pool };
        store.ensure_schema()?;
        Ok(store)
    }

    fn connection(&self) -> Result<PooledConnection<PostgresConnectionManager<MakeTlsConnector>>, StoreError> {
        Ok(self.pool.get()?)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.batch_execute(POSTGRES_SCHEMA)?;
        Ok(())
    }

    pub fn transaction<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T, StoreError>,
    {
        let mut conn = self.connection()?;
        let mut tx = conn.transaction()?;
        let result = {
            let mut unit = PostgresUnitOfWork { tx: &mut tx };
            work(&mut unit)?
        };
        tx.commit()?;
        Ok(result)
    }

    pub fn get_channel(&self, channel_id: &str) -> Result<Option<ChannelRecord>, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = $1"),
            &[&channel_id],
        )?;
        row.as_ref().map(channel_from_row).transpose()
    }

    pub fn upsert_channel_seed(&self, channel: &ChannelRecord) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let credentials_json = serde_json::to_string(&channel.credentials)?;
        conn.execute(
            "INSERT INTO channels (id, provider, merchant_id, status, qr_payload, credentials_json, connect_attempt, updated_at)
             VALUES ($1, $2, $3, $4, NULL, $5, 0, now())
             ON CONFLICT (id) DO UPDATE SET
                provider = excluded.provider,
                merchant_id = excluded.merchant_id,
                credentials_json = excluded.credentials_json",
            &[
                &channel.id,
                &channel.provider.as_str(),
                &channel.merchant_id,
                &channel.status.as_str(),
                &credentials_json,
            ],
        )?;
        Ok(())
    }

    pub fn get_session(
        &self,
        channel_id: &str,
        session_id: &str,
    ) -> Result<Option<SessionSummary>, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            "SELECT merchant_id, message_count, last_message_at
             FROM sessions
             WHERE channel_id = $1 AND session_id = $2",
            &[&channel_id, &session_id],
        )?;
        Ok(row.map(|row| SessionSummary {
            merchant_id: row.get(0),
            channel_id: channel_id.to_string(),
            session_id: session_id.to_string(),
            message_count: row.get(1),
            last_message_at: row.get(2),
        }))
    }

    pub fn list_session_messages(
        &self,
        channel_id: &str,
        session_id: &str,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let mut conn = self.connection()?;
        let rows = conn.query(
            &format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM messages
                 WHERE channel_id = $1 AND session_id = $2
                 ORDER BY seq"
            ),
            &[&channel_id, &session_id],
        )?;
        rows.iter().map(message_from_row).collect()
    }

    pub fn count_messages(&self, channel_id: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_one("SELECT COUNT(*) FROM messages WHERE channel_id = $1", &[&channel_id])?;
        Ok(row.get(0))
    }

    pub fn count_inbound_events(&self, channel_id: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_one(
            "SELECT COUNT(*) FROM inbound_events WHERE channel_id = $1",
            &[&channel_id],
        )?;
        Ok(row.get(0))
    }

    pub fn list_outbox(&self, aggregate_id: &str) -> Result<Vec<OutboxEntry>, StoreError> {
        let mut conn = self.connection()?;
        let rows = conn.query(
            &format!(
                "SELECT {OUTBOX_COLUMNS}
                 FROM outbox_entries
                 WHERE aggregate_id = $1
                 ORDER BY created_at, id"
            ),
            &[&aggregate_id],
        )?;
        rows.iter().map(outbox_from_row).collect()
    }

    pub fn claim_outbox_batch(
        &self,
        worker_id: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ClaimedOutboxEntry>, StoreError> {
        let mut conn = self.connection()?;
        let claim_token = Uuid::new_v4();
        let lease_ms = duration_millis(lease);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut tx = conn.transaction()?;
        let rows = tx.query(
            &format!(
                "WITH candidates AS (
                    SELECT id
                    FROM outbox_entries
                    WHERE published_at IS NULL
                      AND available_at <= now()
                      AND (lease_expires_at IS NULL OR lease_expires_at <= now())
                    ORDER BY created_at, id
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                 )
                 UPDATE outbox_entries AS o
                 SET claim_token = $2,
                     claimed_by = $3,
                     lease_expires_at = now() + ($4::bigint * interval '1 millisecond'),
                     attempts = o.attempts + 1
                 FROM candidates
                 WHERE o.id = candidates.id
                 RETURNING {returning}",
                returning = OUTBOX_COLUMNS
                    .split(", ")
                    .map(|column| format!("o.{}", column))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            &[&limit, &claim_token, &worker_id, &lease_ms],
        )?;
        tx.commit()?;

        let mut claimed = rows
            .iter()
            .map(|row| {
                outbox_from_row(row).map(|entry| ClaimedOutboxEntry { entry, claim_token })
            })
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the CTE order
        claimed.sort_by(|a, b| a.entry.created_at.cmp(&b.entry.created_at));
        Ok(claimed)
    }

    pub fn mark_outbox_published(&self, id: Uuid, claim_token: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let updated = conn.execute(
            "UPDATE outbox_entries
             SET published_at = now(),
                 claim_token = NULL,
                 claimed_by = NULL,
                 lease_expires_at = NULL,
                 last_error = NULL
             WHERE id = $1 AND claim_token = $2 AND published_at IS NULL",
            &[&id, &claim_token],
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
        let mut conn = self.connection()?;
        let backoff_ms = duration_millis(backoff);
        let updated = conn.execute(
            "UPDATE outbox_entries
             SET claim_token = NULL,
                 claimed_by = NULL,
                 lease_expires_at = NULL,
                 last_error = $3,
                 available_at = now() + ($4::bigint * interval '1 millisecond')
             WHERE id = $1 AND claim_token = $2 AND published_at IS NULL",
            &[&id, &claim_token, &error, &backoff_ms],
        )?;
        Ok(updated > 0)
    }
}

struct PostgresUnitOfWork<'a, 'b> {
    tx: &'a mut postgres::Transaction<'b>,
}

impl UnitOfWork for PostgresUnitOfWork<'_, '_> {
    fn insert_inbound_event(&mut self, event: &InboundEvent) -> Result<(), StoreError> {
        let payload_json = serde_json::to_string(&event.payload)?;
        self.tx.execute(
            "INSERT INTO inbound_events (id, channel_id, provider, event_type, payload_json, received_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &event.id,
                &event.channel_id,
                &event.provider.as_str(),
                &event.event_type,
                &payload_json,
                &event.received_at,
            ],
        )?;
        Ok(())
    }

    fn lock_session(&mut self, session: &SessionDescriptor) -> Result<i64, StoreError> {
        self.tx.execute(
            "INSERT INTO sessions (channel_id, session_id, merchant_id, provider, message_count, created_at)
             VALUES ($1, $2, $3, $4, 0, now())
             ON CONFLICT (channel_id, session_id) DO NOTHING",
            &[
                &session.channel_id,
                &session.session_id,
                &session.merchant_id,
                &session.channel.as_str(),
            ],
        )?;
        let row = self.tx.query_one(
            "SELECT message_count
             FROM sessions
             WHERE channel_id = $1 AND session_id = $2
             FOR UPDATE",
            &[&session.channel_id, &session.session_id],
        )?;
        Ok(row.get(0))
    }

    fn insert_message(&mut self, message: &ConversationMessage, seq: i64) -> Result<(), StoreError> {
        let metadata_json = serde_json::to_string(&message.metadata)?;
        self.tx.execute(
            "INSERT INTO messages
                (id, channel_id, session_id, merchant_id, provider, seq, role, text, metadata_json, provider_message_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            &[
                &message.id,
                &message.channel_id,
                &message.session_id,
                &message.merchant_id,
                &message.channel.as_str(),
                &seq,
                &message.role.as_str(),
                &message.text,
                &metadata_json,
                &message.provider_message_id,
                &message.timestamp,
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
        self.tx.execute(
            "UPDATE sessions
             SET message_count = $3, last_message_at = $4
             WHERE channel_id = $1 AND session_id = $2",
            &[&session.channel_id, &session.session_id, &message_count, &last_message_at],
        )?;
        Ok(())
    }

    fn insert_outbox(&mut self, entry: &OutboxEntry) -> Result<(), StoreError> {
        let payload_json = serde_json::to_string(&entry.payload)?;
        self.tx.execute(
            "INSERT INTO outbox_entries
                (id, aggregate_type, aggregate_id, event_type, payload_json, exchange, routing_key, created_at, attempts, available_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $8)",
            &[
                &entry.id,
                &entry.aggregate_type,
                &entry.aggregate_id,
                &entry.event_type.as_str(),
                &payload_json,
                &entry.exchange,
                &entry.routing_key,
                &entry.created_at,
            ],
        )?;
        Ok(())
    }

    fn load_channel_for_update(&mut self, channel_id: &str) -> Result<Option<ChannelRecord>, StoreError> {
        let row = self.tx.query_opt(
            &format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = $1 FOR UPDATE"),
            &[&channel_id],
        )?;
        row.as_ref().map(channel_from_row).transpose()
    }

    fn save_channel(&mut self, channel_id: &str, update: &ChannelUpdate) -> Result<(), StoreError> {
        let updated = self.tx.execute(
            "UPDATE channels
             SET status = $2, qr_payload = $3, connect_attempt = $4, updated_at = now()
             WHERE id = $1",
            &[
                &channel_id,
                &update.status.as_str(),
                &update.qr_payload,
                &update.connect_attempt,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::ChannelNotFound(channel_id.to_string()));
        }
        Ok(())
    }
}

fn channel_from_row(row: &Row) -> Result<ChannelRecord, StoreError> {
    let provider: String = row.get(1);
    let status: String = row.get(3);
    let credentials_json: String = row.get(5);
    Ok(ChannelRecord {
        id: row.get(0),
        provider: parse_column("channels.provider", &provider)?,
        merchant_id: row.get(2),
        status: parse_column("channels.status", &status)?,
        qr_payload: row.get(4),
        credentials: serde_json::from_str(&credentials_json)?,
        connect_attempt: row.get(6),
        updated_at: row.get(7),
    })
}

fn message_from_row(row: &Row) -> Result<StoredMessage, StoreError> {
    let provider: String = row.get(4);
    let role: String = row.get(6);
    let metadata_json: String = row.get(8);
    Ok(StoredMessage {
        seq: row.get(5),
        message: ConversationMessage {
            id: row.get(0),
            channel_id: row.get(1),
            session_id: row.get(2),
            merchant_id: row.get(3),
            channel: parse_column("messages.provider", &provider)?,
            role: parse_column("messages.role", &role)?,
            text: row.get(7),
            metadata: serde_json::from_str(&metadata_json)?,
            provider_message_id: row.get(9),
            timestamp: row.get(10),
        },
    })
}

fn outbox_from_row(row: &Row) -> Result<OutboxEntry, StoreError> {
    let event_type: String = row.get(3);
    let payload_json: String = row.get(4);
    Ok(OutboxEntry {
        id: row.get(0),
        aggregate_type: row.get(1),
        aggregate_id: row.get(2),
        event_type: parse_column("outbox_entries.event_type", &event_type)?,
        payload: serde_json::from_str(&payload_json)?,
        exchange: row.get(5),
        routing_key: row.get(6),
        created_at: row.get(7),
        published_at: row.get(8),
        attempts: row.get(9),
        last_error: row.get(10),
    })
}
