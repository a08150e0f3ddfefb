//! WhatsApp Cloud API (Meta Graph) webhook payloads.
//!
//! A single delivery may batch several messages. Only the first message is
//! normalized and used for deduplication; the full body is kept in the
//! inbound audit record.

use serde::Deserialize;
use serde_json::json;

use crate::channel::Provider;
use crate::ingestion::NormalizedMessage;

use super::{parse_json, unix_timestamp, AdapterError, InboundAdapter, ProviderEvent};

#[derive(Debug, Clone, Default)]
pub struct WhatsAppInboundAdapter;

impl WhatsAppInboundAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl InboundAdapter for WhatsAppInboundAdapter {
    fn parse(&self, raw_payload: &[u8], _event: Option<&str>) -> Result<ProviderEvent, AdapterError> {
        let webhook: WhatsAppWebhook = parse_json(raw_payload)?;

        let change = webhook
            .entry
            .first()
            .ok_or(AdapterError::MissingField("entry"))?
            .changes
            .first()
            .ok_or(AdapterError::MissingField("entry.changes"))?;

        let messages = change.value.messages.as_deref().unwrap_or_default();
        let Some(message) = messages.first() else {
            if change.value.statuses.as_ref().is_some_and(|statuses| !statuses.is_empty()) {
                return Ok(ProviderEvent::Ignored("delivery_status"));
            }
            return Ok(ProviderEvent::Ignored("no_messages"));
        };

        let text = message
            .text
            .as_ref()
            .map(|text| text.body.clone())
            .or_else(|| message.button.as_ref().map(|button| button.text.clone()))
            .or_else(|| {
                message.interactive.as_ref().and_then(|interactive| {
                    interactive
                        .button_reply
                        .as_ref()
                        .map(|reply| reply.title.clone())
                        .or_else(|| interactive.list_reply.as_ref().map(|reply| reply.title.clone()))
                })
            });
        let media = message
            .image
            .as_ref()
            .map(|media| ("image", media))
            .or_else(|| message.audio.as_ref().map(|media| ("audio", media)))
            .or_else(|| message.document.as_ref().map(|media| ("document", media)))
            .or_else(|| message.video.as_ref().map(|media| ("video", media)));

        let text = match (text, media) {
            (Some(text), _) => text,
            (None, Some((_, media))) => media.caption.clone().unwrap_or_default(),
            (None, None) => return Err(AdapterError::MissingField("messages[0].text")),
        };

        let session_id = message.from.trim();
        if session_id.is_empty() {
            return Err(AdapterError::MissingField("messages[0].from"));
        }

        let sender_name = change
            .value
            .contacts
            .as_ref()
            .and_then(|contacts| contacts.first())
            .and_then(|contact| contact.profile.as_ref())
            .map(|profile| profile.name.clone());

        Ok(ProviderEvent::Message(NormalizedMessage {
            claimed_merchant_id: None,
            session_id: session_id.to_string(),
            text,
            sender_name,
            provider_message_id: super::non_empty(Some(&message.id)),
            sent_at: message
                .timestamp
                .as_deref()
                .and_then(|value| value.parse::<i64>().ok())
                .and_then(unix_timestamp),
            metadata: json!({
                "messageType": message.message_type,
                "phoneNumberId": change.value.metadata.as_ref().and_then(|meta| meta.phone_number_id.clone()),
                "mediaType": media.map(|(kind, _)| kind),
                "mediaId": media.map(|(_, media)| media.id.clone()),
                "batchSize": messages.len(),
            }),
        }))
    }

    fn provider(&self) -> Provider {
        Provider::WhatsApp
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppWebhook {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<WhatsAppEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub changes: Vec<WhatsAppChange>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppChange {
    pub value: WhatsAppValue,
    #[serde(default)]
    pub field: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppValue {
    #[serde(default)]
    pub metadata: Option<WhatsAppMetadata>,
    #[serde(default)]
    pub contacts: Option<Vec<WhatsAppContact>>,
    #[serde(default)]
    pub messages: Option<Vec<WhatsAppMessage>>,
    #[serde(default)]
    pub statuses: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppMetadata {
    pub display_phone_number: Option<String>,
    pub phone_number_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppContact {
    pub wa_id: String,
    pub profile: Option<WhatsAppProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppProfile {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppMessage {
    pub id: String,
    pub from: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "type", default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub text: Option<WhatsAppText>,
    #[serde(default)]
    pub button: Option<WhatsAppButton>,
    #[serde(default)]
    pub interactive: Option<WhatsAppInteractive>,
    #[serde(default)]
    pub image: Option<WhatsAppMedia>,
    #[serde(default)]
    pub audio: Option<WhatsAppMedia>,
    #[serde(default)]
    pub document: Option<WhatsAppMedia>,
    #[serde(default)]
    pub video: Option<WhatsAppMedia>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppText {
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppButton {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppInteractive {
    pub button_reply: Option<WhatsAppReply>,
    pub list_reply: Option<WhatsAppReply>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppReply {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppMedia {
    pub id: String,
    #[serde(default)]
    pub caption: Option<String>,
}
