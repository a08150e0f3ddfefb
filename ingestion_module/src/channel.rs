use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Messaging provider a channel is bound to. The string form is the path
/// segment used by the webhook routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Telegram,
    /// Meta WhatsApp Cloud API.
    #[serde(rename = "whatsapp")]
    WhatsApp,
    /// Self-hosted WhatsApp Web gateway paired through a QR code.
    #[serde(rename = "whatsapp_qr")]
    WhatsAppQr,
    Generic,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Telegram => "telegram",
            Provider::WhatsApp => "whatsapp",
            Provider::WhatsAppQr => "whatsapp_qr",
            Provider::Generic => "generic",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "telegram" => Ok(Provider::Telegram),
            "whatsapp" | "whatsapp_cloud" => Ok(Provider::WhatsApp),
            "whatsapp_qr" | "whatsapp-qr" => Ok(Provider::WhatsAppQr),
            "generic" | "webhook" => Ok(Provider::Generic),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Pending,
    Connected,
    #[default]
    Disconnected,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Pending => "pending",
            ChannelStatus::Connected => "connected",
            ChannelStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(ChannelStatus::Pending),
            "connected" => Ok(ChannelStatus::Connected),
            "disconnected" => Ok(ChannelStatus::Disconnected),
            other => Err(format!("unknown channel status: {}", other)),
        }
    }
}

/// Provider secrets attached to a channel. Which fields matter depends on
/// the provider; unused ones stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCredentials {
    /// Shared secret: Telegram `secret_token`, or the HMAC key for generic webhooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    /// Meta app secret used for `X-Hub-Signature-256`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_secret: Option<String>,
    /// Token expected in the Cloud API subscription handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    /// API key shared with a QR-session gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
}

/// A merchant's binding to one messaging provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    pub id: String,
    pub provider: Provider,
    pub merchant_id: String,
    pub status: ChannelStatus,
    pub qr_payload: Option<String>,
    pub credentials: ChannelCredentials,
    /// Bumped on every merchant-initiated connect.
    pub connect_attempt: i64,
    pub updated_at: DateTime<Utc>,
}

impl ChannelRecord {
    pub fn new(
        id: impl Into<String>,
        provider: Provider,
        merchant_id: impl Into<String>,
        credentials: ChannelCredentials,
    ) -> Self {
        Self {
            id: id.into(),
            provider,
            merchant_id: merchant_id.into(),
            status: ChannelStatus::Disconnected,
            qr_payload: None,
            credentials,
            connect_attempt: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn webhook_path(&self) -> String {
        format!("/webhooks/{}/{}", self.provider, self.id)
    }
}

/// New state written back for a channel after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdate {
    pub status: ChannelStatus,
    pub qr_payload: Option<String>,
    pub connect_attempt: i64,
}
