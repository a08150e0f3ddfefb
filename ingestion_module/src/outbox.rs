//! Transactional outbox: events are written in the same transaction as the
//! conversation change they describe and published later by the dispatcher.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::ingestion::ConversationMessage;
use crate::store::{StoreError, UnitOfWork};

pub const CONVERSATION_AGGREGATE: &str = "conversation";

/// Aggregate id of a conversation. Session ids are only unique per channel.
pub fn conversation_aggregate_id(channel_id: &str, session_id: &str) -> String {
    format!("{}:{}", channel_id, session_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboxEventType {
    /// A customer message arrived through a provider webhook.
    ChatIncoming,
    /// A bot or agent reply was recorded for a session.
    ChatReply,
}

impl OutboxEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxEventType::ChatIncoming => "chat.incoming",
            OutboxEventType::ChatReply => "chat.reply",
        }
    }
}

impl fmt::Display for OutboxEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxEventType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "chat.incoming" => Ok(OutboxEventType::ChatIncoming),
            "chat.reply" => Ok(OutboxEventType::ChatReply),
            other => Err(format!("unknown outbox event type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: OutboxEventType,
    pub payload: serde_json::Value,
    pub exchange: String,
    pub routing_key: String,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageEventPayload<'a> {
    event_type: &'static str,
    merchant_id: &'a str,
    channel_id: &'a str,
    session_id: &'a str,
    message: &'a ConversationMessage,
}

impl OutboxEntry {
    /// Outbox row announcing `message`. The exchange is the event type and
    /// the routing key the provider, so consumers can bind per channel kind.
    pub fn for_message(
        event_type: OutboxEventType,
        message: &ConversationMessage,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_value(MessageEventPayload {
            event_type: event_type.as_str(),
            merchant_id: &message.merchant_id,
            channel_id: &message.channel_id,
            session_id: &message.session_id,
            message,
        })?;
        Ok(Self {
            id: Uuid::new_v4(),
            aggregate_type: CONVERSATION_AGGREGATE.to_string(),
            aggregate_id: conversation_aggregate_id(&message.channel_id, &message.session_id),
            event_type,
            payload,
            exchange: event_type.as_str().to_string(),
            routing_key: message.channel.as_str().to_string(),
            created_at: Utc::now(),
            published_at: None,
            attempts: 0,
            last_error: None,
        })
    }

    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }
}

/// A row leased to one dispatcher. Only the holder of `claim_token` can
/// complete or release it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedOutboxEntry {
    pub entry: OutboxEntry,
    pub claim_token: Uuid,
}

/// Appends `entry` inside the caller's transaction. Nothing is visible to the
/// dispatcher until that transaction commits.
pub fn enqueue_event(tx: &mut dyn UnitOfWork, entry: &OutboxEntry) -> Result<(), StoreError> {
    tx.insert_outbox(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Provider;
    use crate::ingestion::MessageRole;
    use serde_json::json;

    fn message() -> ConversationMessage {
        ConversationMessage {
            id: Uuid::new_v4(),
            merchant_id: "m1".to_string(),
            channel_id: "c1".to_string(),
            session_id: "s1".to_string(),
            channel: Provider::WhatsAppQr,
            role: MessageRole::Customer,
            text: "hi".to_string(),
            metadata: json!({}),
            provider_message_id: Some("m1".to_string()),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn entry_routes_by_event_type_and_provider() {
        let message = message();
        let entry = OutboxEntry::for_message(OutboxEventType::ChatIncoming, &message).unwrap();
        assert_eq!(entry.exchange, "chat.incoming");
        assert_eq!(entry.routing_key, "whatsapp_qr");
        assert_eq!(entry.aggregate_type, "conversation");
        assert_eq!(entry.aggregate_id, "c1:s1");
        assert!(!entry.is_published());
        assert_eq!(entry.payload["eventType"], "chat.incoming");
        assert_eq!(entry.payload["merchantId"], "m1");
        assert_eq!(entry.payload["message"]["text"], "hi");
        assert_eq!(entry.payload["message"]["role"], "customer");
    }

    #[test]
    fn event_type_parses_its_own_name() {
        for kind in [OutboxEventType::ChatIncoming, OutboxEventType::ChatReply] {
            assert_eq!(kind.as_str().parse::<OutboxEventType>(), Ok(kind));
        }
        assert!("chat.deleted".parse::<OutboxEventType>().is_err());
    }
}
