pub mod adapters;
pub mod channel;
pub mod channel_registry;
pub mod connectors;
pub mod conversation;
pub mod dispatcher;
pub mod gateway;
pub mod idempotency;
pub mod ingestion;
pub mod message_store;
pub mod outbox;
pub mod store;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
