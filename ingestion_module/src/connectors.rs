//! Outbound calls that open or tear down a provider connection.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::channel::{ChannelRecord, Provider};
use crate::channel_registry::{map_provider_status, ProviderStatus};

pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The provider considers the connection live already.
    Connected,
    /// A QR code must be scanned to pair the session. `qr` is absent when
    /// the gateway delivers it later through a status callback.
    AwaitingScan { qr: Option<String> },
    /// Nothing to call; the provider confirms through a webhook handshake.
    AwaitingVerification,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("channel has no {0} configured")]
    MissingCredential(&'static str),
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, channel: &ChannelRecord, webhook_url: &str) -> Result<ConnectOutcome, ConnectError>;
    async fn disconnect(&self, channel: &ChannelRecord) -> Result<(), ConnectError>;
}

/// Talks to the real provider endpoints.
#[derive(Debug, Clone)]
pub struct ProviderConnector {
    client: reqwest::Client,
    telegram_api_base: String,
}

#[derive(Debug, Deserialize)]
struct QrConnectResponse {
    #[serde(default, alias = "qrcode", alias = "base64")]
    qr: Option<String>,
    #[serde(default, alias = "state")]
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct SetWebhookRequest<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl ProviderConnector {
    pub fn new(telegram_api_base: Option<&str>) -> Result<Self, ConnectError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            telegram_api_base: telegram_api_base
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or(DEFAULT_TELEGRAM_API_BASE)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn qr_session_url<'a>(
        channel: &'a ChannelRecord,
        action: &str,
    ) -> Result<(String, &'a str), ConnectError> {
        let credentials = &channel.credentials;
        let gateway_url = credentials
            .gateway_url
            .as_deref()
            .ok_or(ConnectError::MissingCredential("gateway_url"))?;
        let api_key = credentials
            .api_key
            .as_deref()
            .ok_or(ConnectError::MissingCredential("api_key"))?;
        let session_name = credentials.session_name.as_deref().unwrap_or(&channel.id);
        Ok((
            format!(
                "{}/sessions/{}/{}",
                gateway_url.trim_end_matches('/'),
                session_name,
                action
            ),
            api_key,
        ))
    }

    fn telegram_url(&self, channel: &ChannelRecord, method: &str) -> Result<String, ConnectError> {
        let token = channel
            .credentials
            .bot_token
            .as_deref()
            .ok_or(ConnectError::MissingCredential("bot_token"))?;
        Ok(format!("{}/bot{}/{}", self.telegram_api_base, token, method))
    }

    async fn call_telegram<B>(&self, url: &str, body: &B) -> Result<(), ConnectError>
    where
        B: Serialize + Sync + ?Sized,
    {
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let parsed: Option<TelegramResponse> = serde_json::from_str(&text).ok();
        match parsed {
            Some(reply) if status.is_success() && reply.ok => Ok(()),
            Some(reply) => Err(ConnectError::Provider {
                status: status.as_u16(),
                body: reply.description.unwrap_or(text),
            }),
            None => Err(ConnectError::Provider {
                status: status.as_u16(),
                body: text,
            }),
        }
    }

    async fn connect_qr_session(&self, channel: &ChannelRecord) -> Result<ConnectOutcome, ConnectError> {
        let (url, api_key) = Self::qr_session_url(channel, "connect")?;
        let response = self
            .client
            .post(&url)
            .header("apikey", api_key)
            .json(&json!({ "channelId": channel.id }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectError::Provider { status, body });
        }
        let reply: QrConnectResponse = response.json().await?;

        let live = reply
            .status
            .as_deref()
            .and_then(map_provider_status)
            .is_some_and(|status| status == ProviderStatus::Connected);
        if live {
            return Ok(ConnectOutcome::Connected);
        }
        Ok(ConnectOutcome::AwaitingScan {
            qr: reply.qr.filter(|qr| !qr.trim().is_empty()),
        })
    }
}

#[async_trait]
impl ChannelConnector for ProviderConnector {
    async fn connect(&self, channel: &ChannelRecord, webhook_url: &str) -> Result<ConnectOutcome, ConnectError> {
        match channel.provider {
            Provider::WhatsAppQr => self.connect_qr_session(channel).await,
            Provider::Telegram => {
                let url = self.telegram_url(channel, "setWebhook")?;
                let request = SetWebhookRequest {
                    url: webhook_url,
                    secret_token: channel.credentials.webhook_secret.as_deref(),
                };
                self.call_telegram(&url, &request).await?;
                info!("telegram webhook registered channel={} url={}", channel.id, webhook_url);
                Ok(ConnectOutcome::Connected)
            }
            Provider::WhatsApp => Ok(ConnectOutcome::AwaitingVerification),
            Provider::Generic => Ok(ConnectOutcome::Connected),
        }
    }

    async fn disconnect(&self, channel: &ChannelRecord) -> Result<(), ConnectError> {
        match channel.provider {
            Provider::WhatsAppQr => {
                let (url, api_key) = Self::qr_session_url(channel, "logout")?;
                let response = self.client.post(&url).header("apikey", api_key).send().await?;
                if !response.status().is_success() {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    return Err(ConnectError::Provider { status, body });
                }
                Ok(())
            }
            Provider::Telegram => {
                let url = self.telegram_url(channel, "deleteWebhook")?;
                self.call_telegram(&url, &json!({})).await
            }
            Provider::WhatsApp | Provider::Generic => Ok(()),
        }
    }
}
