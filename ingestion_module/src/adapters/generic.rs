//! Plain JSON webhooks posted by merchant-owned integrations.

use serde::Deserialize;
use serde_json::json;

use crate::channel::Provider;
use crate::ingestion::NormalizedMessage;

use super::{non_empty, parse_json, AdapterError, InboundAdapter, ProviderEvent, StatusUpdate};

#[derive(Debug, Clone, Default)]
pub struct GenericInboundAdapter;

impl GenericInboundAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl InboundAdapter for GenericInboundAdapter {
    fn parse(&self, raw_payload: &[u8], event: Option<&str>) -> Result<ProviderEvent, AdapterError> {
        let payload: GenericPayload = parse_json(raw_payload)?;
        let event = non_empty(event)
            .or_else(|| non_empty(payload.event.as_deref()))
            .unwrap_or_else(|| "incoming".to_string())
            .to_ascii_lowercase();

        match event.as_str() {
            "incoming" | "message" | "incoming_message" => {}
            "status" | "connection" => {
                let raw_status = non_empty(payload.status.as_deref())
                    .ok_or(AdapterError::MissingField("status"))?;
                return Ok(ProviderEvent::Status(StatusUpdate {
                    raw_status,
                    qr_payload: non_empty(payload.qr.as_deref()),
                }));
            }
            _ => return Ok(ProviderEvent::Ignored("unsupported_event")),
        }

        let session_id = non_empty(payload.from.as_deref())
            .or_else(|| non_empty(payload.session_id.as_deref()))
            .ok_or(AdapterError::MissingField("from"))?;
        let text = payload
            .message_text
            .or(payload.text)
            .ok_or(AdapterError::MissingField("messageText"))?;

        let mut metadata = match payload.metadata {
            Some(serde_json::Value::Object(map)) => serde_json::Value::Object(map),
            Some(other) => json!({ "payload": other }),
            None => json!({}),
        };
        if let Some(map) = metadata.as_object_mut() {
            map.insert("batchSize".to_string(), json!(1));
        }

        Ok(ProviderEvent::Message(NormalizedMessage {
            claimed_merchant_id: non_empty(payload.merchant_id.as_deref()),
            session_id,
            text,
            sender_name: non_empty(payload.sender_name.as_deref()),
            provider_message_id: non_empty(payload.message_id.as_deref())
                .or_else(|| non_empty(payload.id.as_deref())),
            sent_at: payload.timestamp,
            metadata,
        }))
    }

    fn provider(&self) -> Provider {
        Provider::Generic
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericPayload {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub merchant_id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message_text: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub qr: Option<String>,
}
