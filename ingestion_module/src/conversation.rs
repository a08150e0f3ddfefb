//! Conversation writes that must be published: the message append and its
//! outbox row always share one transaction.
//!
//! All methods block on the database and are meant to run inside
//! `tokio::task::spawn_blocking`.

use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::ingestion::{
    CanonicalEvent, ConversationMessage, InboundEvent, MessageRole, SessionDescriptor, StoredMessage,
};
use crate::message_store;
use crate::outbox::{self, OutboxEntry, OutboxEventType};
use crate::store::{ChatStore, StoreError, UnitOfWork};

/// Appends `message` to its session and enqueues `entry` on the same unit
/// of work. Either both become visible at commit or neither does.
pub fn append_and_enqueue(
    tx: &mut dyn UnitOfWork,
    session: &SessionDescriptor,
    message: &ConversationMessage,
    entry: &OutboxEntry,
) -> Result<StoredMessage, StoreError> {
    let stored = message_store::create_or_append(tx, session, message)?;
    outbox::enqueue_event(tx, entry)?;
    Ok(stored)
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub stored: StoredMessage,
    pub outbox_id: Uuid,
    pub inbound_event_id: Uuid,
}

/// Who wrote a reply recorded outside the webhook flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyAuthor {
    Bot,
    Agent,
}

impl From<ReplyAuthor> for MessageRole {
    fn from(author: ReplyAuthor) -> Self {
        match author {
            ReplyAuthor::Bot => MessageRole::Bot,
            ReplyAuthor::Agent => MessageRole::Agent,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationService {
    store: ChatStore,
}

impl ConversationService {
    pub fn new(store: ChatStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    /// Records an accepted webhook: audit row, customer message and a
    /// `chat.incoming` outbox row in a single transaction.
    pub fn ingest_inbound(
        &self,
        event: &CanonicalEvent,
        audit: &InboundEvent,
    ) -> Result<IngestOutcome, StoreError> {
        let session = event.session();
        let message = event.to_customer_message();
        let entry = OutboxEntry::for_message(OutboxEventType::ChatIncoming, &message)?;

        let stored = self.store.transaction(|tx| {
            tx.insert_inbound_event(audit)?;
            append_and_enqueue(tx, &session, &message, &entry)
        })?;

        info!(
            "ingested message merchant={} channel={} session={} seq={} outbox={}",
            event.merchant_id, event.channel_id, event.session_id, stored.seq, entry.id
        );
        Ok(IngestOutcome {
            stored,
            outbox_id: entry.id,
            inbound_event_id: audit.id,
        })
    }

    /// Audits an accepted webhook call that carried nothing to store.
    pub fn record_event(&self, audit: &InboundEvent) -> Result<(), StoreError> {
        self.store.transaction(|tx| tx.insert_inbound_event(audit))
    }

    /// Stores a bot or agent reply and enqueues `chat.reply` for delivery.
    pub fn record_reply(
        &self,
        session: &SessionDescriptor,
        author: ReplyAuthor,
        text: &str,
        metadata: Value,
    ) -> Result<StoredMessage, StoreError> {
        let message = ConversationMessage {
            id: Uuid::new_v4(),
            merchant_id: session.merchant_id.clone(),
            channel_id: session.channel_id.clone(),
            session_id: session.session_id.clone(),
            channel: session.channel,
            role: author.into(),
            text: text.to_string(),
            metadata,
            provider_message_id: None,
            timestamp: chrono::Utc::now(),
        };
        let entry = OutboxEntry::for_message(OutboxEventType::ChatReply, &message)?;

        let stored = self
            .store
            .transaction(|tx| append_and_enqueue(tx, session, &message, &entry))?;
        info!(
            "recorded reply channel={} session={} role={} seq={}",
            session.channel_id, session.session_id, stored.message.role, stored.seq
        );
        Ok(stored)
    }
}
