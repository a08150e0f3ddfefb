//! Table definitions. Both backends use the same table and column names;
//! SQLite keeps timestamps as RFC 3339 text in UTC so they sort correctly.

pub const SQLITE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS channels (
    id TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    merchant_id TEXT NOT NULL,
    status TEXT NOT NULL,
    qr_payload TEXT,
    credentials_json TEXT NOT NULL,
    connect_attempt INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS sessions (
    channel_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    merchant_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_message_at TEXT,
    PRIMARY KEY (channel_id, session_id)
);
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    channel_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    merchant_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    seq INTEGER NOT NULL,
    role TEXT NOT NULL,
    text TEXT NOT NULL,
    metadata_json TEXT NOT NULL,
    provider_message_id TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (channel_id, session_id, seq)
);
CREATE TABLE IF NOT EXISTS outbox_entries (
    id TEXT PRIMARY KEY,
    aggregate_type TEXT NOT NULL,
    aggregate_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    exchange TEXT NOT NULL,
    routing_key TEXT NOT NULL,
    created_at TEXT NOT NULL,
    published_at TEXT,
    claim_token TEXT,
    claimed_by TEXT,
    lease_expires_at TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    available_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS outbox_entries_pending_idx
    ON outbox_entries(published_at, available_at, created_at);
CREATE TABLE IF NOT EXISTS inbound_events (
    id TEXT PRIMARY KEY,
    channel_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    received_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS inbound_events_channel_idx
    ON inbound_events(channel_id, received_at);
";

pub const POSTGRES_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS channels (
    id TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    merchant_id TEXT NOT NULL,
    status TEXT NOT NULL,
    qr_payload TEXT,
    credentials_json TEXT NOT NULL,
    connect_attempt BIGINT NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS sessions (
    channel_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    merchant_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    message_count BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_message_at TIMESTAMPTZ,
    PRIMARY KEY (channel_id, session_id)
);
CREATE TABLE IF NOT EXISTS messages (
    id UUID PRIMARY KEY,
    channel_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    merchant_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    seq BIGINT NOT NULL,
    role TEXT NOT NULL,
    text TEXT NOT NULL,
    metadata_json TEXT NOT NULL,
    provider_message_id TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    UNIQUE (channel_id, session_id, seq)
);
CREATE TABLE IF NOT EXISTS outbox_entries (
    id UUID PRIMARY KEY,
    aggregate_type TEXT NOT NULL,
    aggregate_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    exchange TEXT NOT NULL,
    routing_key TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    published_at TIMESTAMPTZ,
    claim_token UUID,
    claimed_by TEXT,
    lease_expires_at TIMESTAMPTZ,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    available_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS outbox_entries_pending_idx
    ON outbox_entries(available_at, created_at)
    WHERE published_at IS NULL;
CREATE TABLE IF NOT EXISTS inbound_events (
    id UUID PRIMARY KEY,
    channel_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    received_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS inbound_events_channel_idx
    ON inbound_events(channel_id, received_at);
";
