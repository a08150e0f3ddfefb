//! Telegram Bot API webhook updates.

use serde::Deserialize;
use serde_json::json;

use crate::channel::Provider;
use crate::ingestion::NormalizedMessage;

use super::{unix_timestamp, parse_json, AdapterError, InboundAdapter, ProviderEvent};

#[derive(Debug, Clone, Default)]
pub struct TelegramInboundAdapter;

impl TelegramInboundAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl InboundAdapter for TelegramInboundAdapter {
    fn parse(&self, raw_payload: &[u8], _event: Option<&str>) -> Result<ProviderEvent, AdapterError> {
        let update: TelegramUpdate = parse_json(raw_payload)?;

        let (message, edited) = match (update.message, update.edited_message) {
            (Some(message), _) => (message, false),
            (None, Some(message)) => (message, true),
            // callback queries, chat member updates and the like
            (None, None) => return Ok(ProviderEvent::Ignored("no_message")),
        };

        let from = message.from.as_ref().ok_or(AdapterError::MissingField("message.from"))?;
        if from.is_bot {
            return Ok(ProviderEvent::Ignored("bot_sender"));
        }

        let media_type = if message.photo.as_ref().is_some_and(|photos| !photos.is_empty()) {
            Some("photo")
        } else if message.document.is_some() {
            Some("document")
        } else if message.voice.is_some() {
            Some("voice")
        } else {
            None
        };
        let text = message.text.clone().or_else(|| message.caption.clone());
        if text.is_none() && media_type.is_none() {
            return Err(AdapterError::MissingField("message.text"));
        }

        let chat_id = message.chat.id;
        let mut provider_message_id = format!("{}:{}", chat_id, message.message_id);
        if edited {
            if let Some(edit_date) = message.edit_date {
                provider_message_id.push_str(&format!(":edit:{}", edit_date));
            }
        }

        let sender_name = from
            .first_name
            .clone()
            .map(|first| match from.last_name.as_deref() {
                Some(last) => format!("{} {}", first, last),
                None => first,
            })
            .or_else(|| from.username.clone());

        Ok(ProviderEvent::Message(NormalizedMessage {
            claimed_merchant_id: None,
            session_id: chat_id.to_string(),
            text: text.unwrap_or_default(),
            sender_name,
            provider_message_id: Some(provider_message_id),
            sent_at: unix_timestamp(message.date),
            metadata: json!({
                "updateId": update.update_id,
                "chatType": message.chat.chat_type,
                "fromId": from.id,
                "edited": edited,
                "mediaType": media_type,
            }),
        }))
    }

    fn provider(&self) -> Provider {
        Provider::Telegram
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub edited_message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    pub chat: TelegramChat,
    pub date: i64,
    #[serde(default)]
    pub edit_date: Option<i64>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Option<Vec<TelegramPhotoSize>>,
    #[serde(default)]
    pub document: Option<TelegramFile>,
    #[serde(default)]
    pub voice: Option<TelegramFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub chat_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramPhotoSize {
    pub file_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramFile {
    pub file_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(payload: &str) -> Result<ProviderEvent, AdapterError> {
        TelegramInboundAdapter::new().parse(payload.as_bytes(), None)
    }

    #[test]
    fn parse_text_message() {
        let payload = r#"{
            "update_id": 10000,
            "message": {
                "message_id": 1365,
                "from": {"id": 1111111, "is_bot": false, "first_name": "Test", "last_name": "User"},
                "chat": {"id": 1111111, "type": "private"},
                "date": 1441645532,
                "text": "Hello bot"
            }
        }"#;

        let ProviderEvent::Message(message) = parse(payload).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(message.session_id, "1111111");
        assert_eq!(message.text, "Hello bot");
        assert_eq!(message.sender_name.as_deref(), Some("Test User"));
        assert_eq!(message.provider_message_id.as_deref(), Some("1111111:1365"));
        assert_eq!(message.metadata["chatType"], "private");
    }

    #[test]
    fn edited_message_gets_distinct_id() {
        let payload = r#"{
            "update_id": 10001,
            "edited_message": {
                "message_id": 1365,
                "from": {"id": 1, "first_name": "A"},
                "chat": {"id": 1},
                "date": 1441645532,
                "edit_date": 1441645600,
                "text": "Hello again"
            }
        }"#;
        let ProviderEvent::Message(message) = parse(payload).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(message.provider_message_id.as_deref(), Some("1:1365:edit:1441645600"));
    }

    #[test]
    fn photo_without_caption_is_accepted() {
        let payload = r#"{
            "update_id": 1,
            "message": {
                "message_id": 7, "from": {"id": 2}, "chat": {"id": 2}, "date": 0,
                "photo": [{"file_id": "small"}, {"file_id": "large"}]
            }
        }"#;
        let ProviderEvent::Message(message) = parse(payload).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(message.text, "");
        assert_eq!(message.metadata["mediaType"], "photo");
    }

    #[test]
    fn non_message_updates_are_ignored() {
        let payload = r#"{"update_id": 2, "callback_query": {"id": "x"}}"#;
        assert_eq!(parse(payload).unwrap(), ProviderEvent::Ignored("no_message"));

        let from_bot = r#"{
            "update_id": 3,
            "message": {"message_id": 1, "from": {"id": 9, "is_bot": true}, "chat": {"id": 9}, "date": 0, "text": "echo"}
        }"#;
        assert_eq!(parse(from_bot).unwrap(), ProviderEvent::Ignored("bot_sender"));
    }

    #[test]
    fn empty_message_is_rejected() {
        let payload = r#"{
            "update_id": 4,
            "message": {"message_id": 1, "from": {"id": 9}, "chat": {"id": 9}, "date": 0}
        }"#;
        assert!(matches!(parse(payload), Err(AdapterError::MissingField("message.text"))));
        assert!(matches!(parse("{not json"), Err(AdapterError::Malformed(_))));
    }
}
