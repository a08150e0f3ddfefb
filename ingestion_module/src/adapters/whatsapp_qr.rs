//! QR-paired WhatsApp Web gateways (Evolution/WAHA style).
//!
//! The same webhook URL receives both inbound messages and session status
//! callbacks, distinguished by the route's event segment or the body's
//! `event` field.

use serde::Deserialize;
use serde_json::json;

use crate::channel::Provider;
use crate::ingestion::NormalizedMessage;

use super::{non_empty, parse_json, unix_timestamp, AdapterError, InboundAdapter, ProviderEvent, StatusUpdate};

const STATUS_EVENTS: &[&str] = &[
    "status",
    "connection",
    "connection.update",
    "connection_update",
    "session.status",
    "qr",
    "qrcode.updated",
    "qrcode_updated",
];

#[derive(Debug, Clone, Default)]
pub struct WhatsAppQrInboundAdapter;

impl WhatsAppQrInboundAdapter {
    pub fn new() -> Self {
        Self
    }
}

/// Per-message delivery states some gateways post with a bare top-level
/// `status`. They say nothing about the session.
const MESSAGE_STATUSES: &[&str] = &[
    "failed",
    "error",
    "pending",
    "sent",
    "server_ack",
    "delivered",
    "delivery_ack",
    "read",
    "played",
];

fn is_status_event(event: &str) -> bool {
    let event = event.trim().to_ascii_lowercase();
    STATUS_EVENTS.contains(&event.as_str())
}

fn is_message_status(status: &str) -> bool {
    let status = status.trim().to_ascii_lowercase();
    MESSAGE_STATUSES.contains(&status.as_str())
}

impl InboundAdapter for WhatsAppQrInboundAdapter {
    fn parse(&self, raw_payload: &[u8], event: Option<&str>) -> Result<ProviderEvent, AdapterError> {
        let payload: QrGatewayPayload = parse_json(raw_payload)?;
        let event = non_empty(event).or_else(|| non_empty(payload.event.as_deref()));

        let messages = payload.messages.as_deref().unwrap_or_default();
        let connection_event = event.as_deref().is_some_and(is_status_event);
        let status_like =
            connection_event || (messages.is_empty() && (payload.status.is_some() || payload.state.is_some()));

        if status_like {
            let qr_payload = non_empty(payload.qr.as_deref());
            let raw_status = non_empty(payload.status.as_deref())
                .or_else(|| non_empty(payload.state.as_deref()))
                .or_else(|| qr_payload.as_ref().map(|_| "qr".to_string()))
                .ok_or(AdapterError::MissingField("status"))?;
            if !connection_event && is_message_status(&raw_status) {
                return Ok(ProviderEvent::Ignored("message_status"));
            }
            return Ok(ProviderEvent::Status(StatusUpdate { raw_status, qr_payload }));
        }

        let Some(message) = messages.first() else {
            return Ok(ProviderEvent::Ignored("no_messages"));
        };
        if message.key.as_ref().is_some_and(|key| key.from_me) || message.from_me {
            return Ok(ProviderEvent::Ignored("own_message"));
        }

        let session_id = message
            .key
            .as_ref()
            .and_then(|key| non_empty(key.remote_jid.as_deref()))
            .or_else(|| non_empty(message.from.as_deref()))
            .ok_or(AdapterError::MissingField("messages[0].key.remoteJid"))?;

        let provider_message_id = message
            .key
            .as_ref()
            .and_then(|key| non_empty(key.id.as_deref()))
            .or_else(|| non_empty(message.id.as_deref()));

        let text = message
            .text
            .clone()
            .or_else(|| message.body.clone())
            .or_else(|| {
                message.message.as_ref().and_then(|content| {
                    content.conversation.clone().or_else(|| {
                        content
                            .extended_text_message
                            .as_ref()
                            .map(|extended| extended.text.clone())
                    })
                })
            })
            .ok_or(AdapterError::MissingField("messages[0].text"))?;

        Ok(ProviderEvent::Message(NormalizedMessage {
            claimed_merchant_id: None,
            session_id,
            text,
            sender_name: non_empty(message.push_name.as_deref()),
            provider_message_id,
            sent_at: message.message_timestamp.and_then(unix_timestamp),
            metadata: json!({
                "instance": payload.instance,
                "batchSize": messages.len(),
            }),
        }))
    }

    fn provider(&self) -> Provider {
        Provider::WhatsAppQr
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QrGatewayPayload {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub qr: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<QrGatewayMessage>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrGatewayMessage {
    #[serde(default)]
    pub key: Option<QrMessageKey>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub message: Option<QrMessageContent>,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub message_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrMessageKey {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub remote_jid: Option<String>,
    #[serde(default)]
    pub from_me: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrMessageContent {
    #[serde(default)]
    pub conversation: Option<String>,
    #[serde(default)]
    pub extended_text_message: Option<QrExtendedText>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QrExtendedText {
    pub text: String,
}
