//! Connection state of merchant channels.
//!
//! States move `disconnected -> pending -> connected` and back to
//! `disconnected` on logout or provider errors. Changes come from two
//! sources only: merchant connect/disconnect actions and provider status
//! callbacks. The registry never polls providers; UIs poll
//! [`ChannelRegistry::status_view`].

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::channel::{ChannelRecord, ChannelStatus, ChannelUpdate, Provider};
use crate::connectors::{ChannelConnector, ConnectError, ConnectOutcome};
use crate::ingestion::InboundEvent;
use crate::store::{ChatStore, StoreError};

/// Provider status vocabulary reduced to what drives the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Connected,
    Disconnected,
    QrRefresh,
}

/// Maps a raw provider status string. Anything not listed returns `None`
/// and is ignored by callers.
pub fn map_provider_status(raw: &str) -> Option<ProviderStatus> {
    let normalized: String = raw
        .trim()
        .chars()
        .map(|ch| match ch {
            '-' | ' ' | '.' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect();

    match normalized.as_str() {
        "open" | "connected" | "authenticated" | "ready" | "online" | "working" | "inchat" => {
            Some(ProviderStatus::Connected)
        }
        "close" | "closed" | "disconnected" | "logout" | "logged_out" | "loggedout" | "conflict"
        | "failed" | "stopped" | "offline" | "unpaired" => Some(ProviderStatus::Disconnected),
        "qr" | "qrcode" | "qrcode_updated" | "scan_qr_code" | "pairing" => Some(ProviderStatus::QrRefresh),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusSignal {
    Connected,
    Disconnected,
    QrIssued(String),
    /// Merchant asked to (re)connect. Starts a new attempt.
    ConnectRequested { qr: Option<String> },
}

impl StatusSignal {
    /// Signal carried by a provider callback. A QR refresh without a QR
    /// payload carries nothing to act on.
    pub fn from_callback(raw_status: &str, qr_payload: Option<String>) -> Option<Self> {
        match map_provider_status(raw_status)? {
            ProviderStatus::Connected => Some(StatusSignal::Connected),
            ProviderStatus::Disconnected => Some(StatusSignal::Disconnected),
            ProviderStatus::QrRefresh => qr_payload
                .filter(|qr| !qr.trim().is_empty())
                .map(StatusSignal::QrIssued),
        }
    }
}

/// Next state for `channel` under `signal`, or `None` when nothing changes.
pub fn transition(channel: &ChannelRecord, signal: &StatusSignal) -> Option<ChannelUpdate> {
    let update = match signal {
        StatusSignal::Connected => ChannelUpdate {
            status: ChannelStatus::Connected,
            qr_payload: None,
            connect_attempt: channel.connect_attempt,
        },
        StatusSignal::Disconnected => ChannelUpdate {
            status: ChannelStatus::Disconnected,
            qr_payload: None,
            connect_attempt: channel.connect_attempt,
        },
        StatusSignal::QrIssued(qr) => {
            // a QR arriving after the session paired (or was torn down) is stale
            if channel.status != ChannelStatus::Pending {
                return None;
            }
            ChannelUpdate {
                status: ChannelStatus::Pending,
                qr_payload: Some(qr.clone()),
                connect_attempt: channel.connect_attempt,
            }
        }
        StatusSignal::ConnectRequested { qr } => {
            return Some(ChannelUpdate {
                status: ChannelStatus::Pending,
                qr_payload: qr.clone(),
                connect_attempt: channel.connect_attempt + 1,
            });
        }
    };

    if update.status == channel.status && update.qr_payload == channel.qr_payload {
        return None;
    }
    Some(update)
}

fn apply(mut channel: ChannelRecord, update: &ChannelUpdate) -> ChannelRecord {
    channel.status = update.status;
    channel.qr_payload = update.qr_payload.clone();
    channel.connect_attempt = update.connect_attempt;
    channel
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("channel not found: {0}")]
    NotFound(String),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("provider connect failed: {0}")]
    Connect(#[from] ConnectError),
    #[error("blocking task failed: {0}")]
    Join(String),
}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ChannelNotFound(id) => RegistryError::NotFound(id),
            other => RegistryError::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatusView {
    pub channel_id: String,
    pub provider: Provider,
    pub status: ChannelStatus,
    pub details: StatusDetails,
}

/// Result of one provider status callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackOutcome {
    pub status: ChannelStatus,
    /// `false` for status strings outside the mapped vocabulary.
    pub recognized: bool,
    pub changed: bool,
}

#[derive(Clone)]
pub struct ChannelRegistry {
    store: ChatStore,
    connector: Arc<dyn ChannelConnector>,
    public_base_url: Option<String>,
}

impl ChannelRegistry {
    pub fn new(
        store: ChatStore,
        connector: Arc<dyn ChannelConnector>,
        public_base_url: Option<String>,
    ) -> Self {
        Self {
            store,
            connector,
            public_base_url: public_base_url
                .map(|url| url.trim().trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
        }
    }

    pub fn webhook_url(&self, channel: &ChannelRecord) -> Option<String> {
        self.public_base_url
            .as_ref()
            .map(|base| format!("{}{}", base, channel.webhook_path()))
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T, RegistryError>
    where
        F: FnOnce(ChatStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || work(store))
            .await
            .map_err(|err| RegistryError::Join(err.to_string()))?
            .map_err(RegistryError::from)
    }

    /// Applies `signal` only while the channel is still pending on
    /// `attempt`. Anything newer (a callback that already connected the
    /// channel, or a later connect) wins.
    async fn apply_if_current(
        &self,
        channel_id: &str,
        attempt: i64,
        signal: StatusSignal,
    ) -> Result<bool, RegistryError> {
        let channel_id = channel_id.to_string();
        self.blocking(move |store| {
            store.transaction(|tx| {
                let channel = tx
                    .load_channel_for_update(&channel_id)?
                    .ok_or_else(|| StoreError::ChannelNotFound(channel_id.clone()))?;
                if channel.connect_attempt != attempt || channel.status != ChannelStatus::Pending {
                    debug!(
                        "skipping stale connect result channel={} attempt={} current_attempt={} status={}",
                        channel_id, attempt, channel.connect_attempt, channel.status
                    );
                    return Ok(false);
                }
                match transition(&channel, &signal) {
                    Some(update) => {
                        tx.save_channel(&channel_id, &update)?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            })
        })
        .await
    }

    /// Merchant-initiated connect. The channel goes to `pending` before the
    /// provider is called; the provider's answer is applied afterwards only
    /// if no newer state arrived in between.
    pub async fn connect(&self, channel_id: &str) -> Result<ChannelStatusView, RegistryError> {
        let id = channel_id.to_string();
        let channel = self
            .blocking(move |store| {
                store.transaction(|tx| {
                    let channel = tx
                        .load_channel_for_update(&id)?
                        .ok_or_else(|| StoreError::ChannelNotFound(id.clone()))?;
                    let signal = StatusSignal::ConnectRequested { qr: None };
                    match transition(&channel, &signal) {
                        Some(update) => {
                            tx.save_channel(&id, &update)?;
                            Ok(apply(channel, &update))
                        }
                        None => Ok(channel),
                    }
                })
            })
            .await?;
        let attempt = channel.connect_attempt;
        info!(
            "connect requested channel={} provider={} attempt={}",
            channel.id, channel.provider, attempt
        );

        let webhook_url = self
            .webhook_url(&channel)
            .unwrap_or_else(|| channel.webhook_path());
        match self.connector.connect(&channel, &webhook_url).await {
            Ok(ConnectOutcome::Connected) => {
                self.apply_if_current(channel_id, attempt, StatusSignal::Connected)
                    .await?;
            }
            Ok(ConnectOutcome::AwaitingScan { qr: Some(qr) }) => {
                self.apply_if_current(channel_id, attempt, StatusSignal::QrIssued(qr))
                    .await?;
            }
            Ok(ConnectOutcome::AwaitingScan { qr: None }) | Ok(ConnectOutcome::AwaitingVerification) => {}
            Err(err) => {
                warn!("provider connect failed channel={}: {}", channel_id, err);
                self.apply_if_current(channel_id, attempt, StatusSignal::Disconnected)
                    .await?;
                return Err(RegistryError::Connect(err));
            }
        }

        self.status_view(channel_id).await
    }

    /// Merchant-initiated disconnect. Provider teardown is best effort; the
    /// channel is marked disconnected either way.
    pub async fn disconnect(&self, channel_id: &str) -> Result<ChannelStatusView, RegistryError> {
        let id = channel_id.to_string();
        let channel = self
            .blocking(move |store| store.get_channel(&id))
            .await?
            .ok_or_else(|| RegistryError::NotFound(channel_id.to_string()))?;

        if let Err(err) = self.connector.disconnect(&channel).await {
            warn!("provider disconnect failed channel={}: {}", channel_id, err);
        }

        let id = channel_id.to_string();
        self.blocking(move |store| {
            store.transaction(|tx| {
                let channel = tx
                    .load_channel_for_update(&id)?
                    .ok_or_else(|| StoreError::ChannelNotFound(id.clone()))?;
                if let Some(update) = transition(&channel, &StatusSignal::Disconnected) {
                    tx.save_channel(&id, &update)?;
                }
                Ok(())
            })
        })
        .await?;
        info!("channel disconnected channel={}", channel_id);

        self.status_view(channel_id).await
    }

    /// Applies a provider status callback and records it in the audit log,
    /// in one transaction. Unmapped statuses are audited but change nothing.
    pub async fn apply_callback(
        &self,
        channel_id: &str,
        raw_status: &str,
        qr_payload: Option<String>,
        audit: InboundEvent,
    ) -> Result<CallbackOutcome, RegistryError> {
        let id = channel_id.to_string();
        let raw = raw_status.to_string();
        let outcome = self
            .blocking(move |store| {
                store.transaction(|tx| {
                    let channel = tx
                        .load_channel_for_update(&id)?
                        .ok_or_else(|| StoreError::ChannelNotFound(id.clone()))?;
                    tx.insert_inbound_event(&audit)?;

                    let Some(signal) = StatusSignal::from_callback(&raw, qr_payload) else {
                        return Ok(CallbackOutcome {
                            status: channel.status,
                            recognized: false,
                            changed: false,
                        });
                    };
                    match transition(&channel, &signal) {
                        Some(update) => {
                            tx.save_channel(&id, &update)?;
                            Ok(CallbackOutcome {
                                status: update.status,
                                recognized: true,
                                changed: true,
                            })
                        }
                        None => Ok(CallbackOutcome {
                            status: channel.status,
                            recognized: true,
                            changed: false,
                        }),
                    }
                })
            })
            .await?;

        if !outcome.recognized {
            debug!("ignoring unmapped provider status channel={} status={}", channel_id, raw_status);
        } else if outcome.changed {
            info!(
                "channel status changed channel={} status={} raw={}",
                channel_id, outcome.status, raw_status
            );
        }
        Ok(outcome)
    }

    /// Cloud API subscription handshake succeeded: the webhook is live.
    pub async fn mark_webhook_verified(&self, channel_id: &str) -> Result<ChannelStatus, RegistryError> {
        let id = channel_id.to_string();
        let status = self
            .blocking(move |store| {
                store.transaction(|tx| {
                    let channel = tx
                        .load_channel_for_update(&id)?
                        .ok_or_else(|| StoreError::ChannelNotFound(id.clone()))?;
                    match transition(&channel, &StatusSignal::Connected) {
                        Some(update) => {
                            tx.save_channel(&id, &update)?;
                            Ok(update.status)
                        }
                        None => Ok(channel.status),
                    }
                })
            })
            .await?;
        info!("webhook verified channel={}", channel_id);
        Ok(status)
    }

    pub async fn status_view(&self, channel_id: &str) -> Result<ChannelStatusView, RegistryError> {
        let id = channel_id.to_string();
        let channel = self
            .blocking(move |store| store.get_channel(&id))
            .await?
            .ok_or_else(|| RegistryError::NotFound(channel_id.to_string()))?;
        Ok(self.view(&channel))
    }

    pub fn view(&self, channel: &ChannelRecord) -> ChannelStatusView {
        ChannelStatusView {
            channel_id: channel.id.clone(),
            provider: channel.provider,
            status: channel.status,
            details: StatusDetails {
                webhook_url: self.webhook_url(channel),
                qr: match channel.status {
                    ChannelStatus::Pending => channel.qr_payload.clone(),
                    _ => None,
                },
            },
        }
    }
}
