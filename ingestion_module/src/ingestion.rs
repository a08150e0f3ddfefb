use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::{ChannelRecord, Provider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Customer,
    Bot,
    Agent,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::Customer => "customer",
            MessageRole::Bot => "bot",
            MessageRole::Agent => "agent",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "customer" => Ok(MessageRole::Customer),
            "bot" => Ok(MessageRole::Bot),
            "agent" => Ok(MessageRole::Agent),
            other => Err(format!("unknown message role: {}", other)),
        }
    }
}

/// Provider-agnostic message produced by an inbound adapter, before the
/// gateway binds it to the authenticated channel.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    /// Merchant id claimed by the payload itself, if the provider sends one.
    pub claimed_merchant_id: Option<String>,
    pub session_id: String,
    pub text: String,
    pub sender_name: Option<String>,
    pub provider_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

/// The canonical event every provider payload is reduced to.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent {
    pub merchant_id: String,
    pub channel_id: String,
    pub session_id: String,
    pub channel: Provider,
    pub text: String,
    pub metadata: serde_json::Value,
    pub provider_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("payload merchant {claimed} does not match channel merchant {bound}")]
pub struct MerchantMismatch {
    pub claimed: String,
    pub bound: String,
}

impl CanonicalEvent {
    /// Binds a normalized message to the channel resolved from the request
    /// path. The merchant always comes from the channel; a payload that
    /// claims another merchant is rejected.
    pub fn bind(
        channel: &ChannelRecord,
        message: NormalizedMessage,
    ) -> Result<Self, MerchantMismatch> {
        if let Some(claimed) = message
            .claimed_merchant_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            if claimed != channel.merchant_id {
                return Err(MerchantMismatch {
                    claimed: claimed.to_string(),
                    bound: channel.merchant_id.clone(),
                });
            }
        }

        let mut metadata = match message.metadata {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("provider".to_string(), other);
                map
            }
        };
        if let Some(name) = message.sender_name {
            metadata
                .entry("senderName")
                .or_insert(serde_json::Value::String(name));
        }

        Ok(Self {
            merchant_id: channel.merchant_id.clone(),
            channel_id: channel.id.clone(),
            session_id: message.session_id,
            channel: channel.provider,
            text: message.text,
            metadata: serde_json::Value::Object(metadata),
            provider_message_id: message.provider_message_id,
            sent_at: message.sent_at,
        })
    }

    pub fn session(&self) -> SessionDescriptor {
        SessionDescriptor {
            merchant_id: self.merchant_id.clone(),
            channel_id: self.channel_id.clone(),
            session_id: self.session_id.clone(),
            channel: self.channel,
        }
    }

    pub fn to_customer_message(&self) -> ConversationMessage {
        ConversationMessage {
            id: Uuid::new_v4(),
            merchant_id: self.merchant_id.clone(),
            channel_id: self.channel_id.clone(),
            session_id: self.session_id.clone(),
            channel: self.channel,
            role: MessageRole::Customer,
            text: self.text.clone(),
            metadata: self.metadata.clone(),
            provider_message_id: self.provider_message_id.clone(),
            timestamp: self.sent_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Key of the session aggregate: one conversation per customer and channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub merchant_id: String,
    pub channel_id: String,
    pub session_id: String,
    pub channel: Provider,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: Uuid,
    pub merchant_id: String,
    pub channel_id: String,
    pub session_id: String,
    pub channel: Provider,
    pub role: MessageRole,
    pub text: String,
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message: ConversationMessage,
    pub seq: i64,
}

/// Audit record of an accepted webhook call. Written once, never updated.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub id: Uuid,
    pub channel_id: String,
    pub provider: Provider,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(
        channel: &ChannelRecord,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_id: channel.id.clone(),
            provider: channel.provider,
            event_type: event_type.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}

/// Parses a raw webhook body for the audit log. Non-JSON bodies are kept
/// as a string so the record is never lost.
pub fn raw_payload_json(raw_payload: &[u8]) -> serde_json::Value {
    serde_json::from_slice(raw_payload).unwrap_or_else(|_| {
        serde_json::Value::String(String::from_utf8_lossy(raw_payload).into_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalized(claimed: Option<&str>) -> NormalizedMessage {
        NormalizedMessage {
            claimed_merchant_id: claimed.map(str::to_string),
            session_id: "s1".to_string(),
            text: "hello".to_string(),
            sender_name: Some("Ana".to_string()),
            provider_message_id: Some("m1".to_string()),
            sent_at: None,
            metadata: json!({"batchSize": 1}),
        }
    }

    #[test]
    fn bind_takes_merchant_from_channel() {
        let channel = ChannelRecord::new("c1", Provider::Generic, "m1", Default::default());
        let event = CanonicalEvent::bind(&channel, normalized(None)).unwrap();
        assert_eq!(event.merchant_id, "m1");
        assert_eq!(event.channel_id, "c1");
        assert_eq!(event.metadata["senderName"], "Ana");
        assert_eq!(event.metadata["batchSize"], 1);

        let matching = CanonicalEvent::bind(&channel, normalized(Some(" m1 "))).unwrap();
        assert_eq!(matching.merchant_id, "m1");
    }

    #[test]
    fn bind_rejects_foreign_merchant() {
        let channel = ChannelRecord::new("c1", Provider::Generic, "m1", Default::default());
        let err = CanonicalEvent::bind(&channel, normalized(Some("m2"))).unwrap_err();
        assert_eq!(err.claimed, "m2");
        assert_eq!(err.bound, "m1");
    }

    #[test]
    fn customer_message_carries_session_and_role() {
        let channel = ChannelRecord::new("c1", Provider::Telegram, "m1", Default::default());
        let event = CanonicalEvent::bind(&channel, normalized(None)).unwrap();
        let message = event.to_customer_message();
        assert_eq!(message.role, MessageRole::Customer);
        assert_eq!(message.session_id, "s1");
        assert_eq!(message.channel, Provider::Telegram);
    }

    #[test]
    fn raw_payload_json_keeps_non_json_bodies() {
        assert_eq!(raw_payload_json(br#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(raw_payload_json(b"From=%2B1"), json!("From=%2B1"));
    }
}
