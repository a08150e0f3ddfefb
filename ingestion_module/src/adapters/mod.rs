//! Inbound adapters for the supported messaging providers.
//!
//! Each adapter turns one provider-specific webhook body into a
//! [`ProviderEvent`]. Provider parsing stays inside its own module; shared
//! gateway logic only ever sees the normalized shapes.

pub mod generic;
pub mod telegram;
pub mod whatsapp;
pub mod whatsapp_qr;

use crate::channel::Provider;
use crate::ingestion::NormalizedMessage;

pub use generic::GenericInboundAdapter;
pub use telegram::TelegramInboundAdapter;
pub use whatsapp::WhatsAppInboundAdapter;
pub use whatsapp_qr::WhatsAppQrInboundAdapter;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Connection status reported by a provider callback, before mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub raw_status: String,
    pub qr_payload: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Message(NormalizedMessage),
    Status(StatusUpdate),
    /// Valid provider traffic that carries nothing to store (delivery
    /// receipts, echoes of our own messages, membership updates).
    Ignored(&'static str),
}

impl ProviderEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ProviderEvent::Message(_) => "message",
            ProviderEvent::Status(_) => "status",
            ProviderEvent::Ignored(_) => "ignored",
        }
    }
}

pub trait InboundAdapter: Send + Sync {
    /// `event` is the optional sub-path segment of the webhook route.
    fn parse(&self, raw_payload: &[u8], event: Option<&str>) -> Result<ProviderEvent, AdapterError>;
    fn provider(&self) -> Provider;
}

pub fn adapter_for(provider: Provider) -> Box<dyn InboundAdapter> {
    match provider {
        Provider::Telegram => Box::new(TelegramInboundAdapter::new()),
        Provider::WhatsApp => Box::new(WhatsAppInboundAdapter::new()),
        Provider::WhatsAppQr => Box::new(WhatsAppQrInboundAdapter::new()),
        Provider::Generic => Box::new(GenericInboundAdapter::new()),
    }
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(raw_payload: &[u8]) -> Result<T, AdapterError> {
    serde_json::from_slice(raw_payload).map_err(|err| AdapterError::Malformed(err.to_string()))
}

pub(crate) fn unix_timestamp(seconds: i64) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp(seconds, 0)
}
