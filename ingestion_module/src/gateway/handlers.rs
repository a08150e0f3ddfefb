use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::adapters::{adapter_for, ProviderEvent};
use crate::channel::{ChannelRecord, ChannelStatus, Provider};
use crate::channel_registry::ChannelStatusView;
use crate::idempotency::build_idempotency_key;
use crate::ingestion::{raw_payload_json, CanonicalEvent, InboundEvent, NormalizedMessage};

use super::error::GatewayError;
use super::state::GatewayState;
use super::verify::{verify_webhook, verify_whatsapp_subscription};

type GatewayResult<T> = Result<T, GatewayError>;

/// Acknowledgement returned to providers.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_status: Option<ChannelStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl WebhookAck {
    fn new(status: &'static str) -> Self {
        Self {
            status,
            session_id: None,
            message_id: None,
            channel_status: None,
            reason: None,
        }
    }
}

pub(super) async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub(super) async fn ingest_webhook(
    State(state): State<Arc<GatewayState>>,
    Path((provider, channel_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> GatewayResult<Json<WebhookAck>> {
    process_webhook(&state, &provider, &channel_id, None, &headers, &body).await
}

pub(super) async fn ingest_webhook_event(
    State(state): State<Arc<GatewayState>>,
    Path((provider, channel_id, event)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> GatewayResult<Json<WebhookAck>> {
    process_webhook(&state, &provider, &channel_id, Some(&event), &headers, &body).await
}

async fn process_webhook(
    state: &GatewayState,
    provider: &str,
    channel_id: &str,
    event: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> GatewayResult<Json<WebhookAck>> {
    if !state.rate_limiter.check(channel_id) {
        return Err(GatewayError::RateLimited);
    }
    let channel = load_channel_for_path(state, provider, channel_id).await?;
    verify_webhook(&channel, headers, body).map_err(GatewayError::Unauthorized)?;

    let parsed = adapter_for(channel.provider).parse(body, event)?;
    match parsed {
        ProviderEvent::Ignored(reason) => {
            debug!("gateway ignoring {} event channel={}: {}", channel.provider, channel.id, reason);
            let audit = InboundEvent::new(&channel, "ignored", raw_payload_json(body));
            let conversations = state.conversations.clone();
            tokio::task::spawn_blocking(move || conversations.record_event(&audit))
                .await
                .map_err(|err| GatewayError::Persistence(err.to_string()))?
                .map_err(|err| {
                    error!("gateway audit write failed channel={}: {}", channel.id, err);
                    GatewayError::Persistence(err.to_string())
                })?;
            Ok(Json(WebhookAck {
                reason: Some(reason),
                ..WebhookAck::new("ignored")
            }))
        }
        ProviderEvent::Status(update) => {
            let audit = InboundEvent::new(&channel, "status", raw_payload_json(body));
            let outcome = state
                .registry
                .apply_callback(&channel.id, &update.raw_status, update.qr_payload, audit)
                .await?;
            let status = if outcome.recognized { "accepted" } else { "ignored" };
            Ok(Json(WebhookAck {
                channel_status: Some(outcome.status),
                ..WebhookAck::new(status)
            }))
        }
        ProviderEvent::Message(message) => ingest_message(state, &channel, message, body).await,
    }
}

async fn ingest_message(
    state: &GatewayState,
    channel: &ChannelRecord,
    message: NormalizedMessage,
    body: &[u8],
) -> GatewayResult<Json<WebhookAck>> {
    let event = CanonicalEvent::bind(channel, message)?;

    let idempotency_key = event
        .provider_message_id
        .as_deref()
        .map(|message_id| build_idempotency_key(event.channel, &event.channel_id, &event.merchant_id, message_id));
    if let Some(key) = idempotency_key.as_deref() {
        if state.guard.check_and_mark(key).await {
            info!(
                "gateway duplicate ignored channel={} message_id={:?}",
                event.channel_id, event.provider_message_id
            );
            return Ok(Json(WebhookAck {
                session_id: Some(event.session_id.clone()),
                message_id: event.provider_message_id.clone(),
                ..WebhookAck::new("duplicate_ignored")
            }));
        }
    } else {
        debug!("gateway message without provider id channel={}, skipping dedup", event.channel_id);
    }

    let audit = InboundEvent::new(channel, "message", raw_payload_json(body));
    let conversations = state.conversations.clone();
    let task_event = event.clone();
    let result = tokio::task::spawn_blocking(move || conversations.ingest_inbound(&task_event, &audit))
        .await
        .map_err(|err| err.to_string())
        .and_then(|result| result.map_err(|err| err.to_string()));

    match result {
        Ok(outcome) => {
            debug!(
                "gateway accepted channel={} session={} seq={}",
                event.channel_id, event.session_id, outcome.stored.seq
            );
            Ok(Json(WebhookAck {
                session_id: Some(event.session_id),
                message_id: event.provider_message_id,
                ..WebhookAck::new("accepted")
            }))
        }
        Err(err) => {
            if let Some(key) = idempotency_key.as_deref() {
                state.guard.release(key).await;
            }
            Err(GatewayError::Persistence(err))
        }
    }
}

async fn load_channel(state: &GatewayState, channel_id: &str) -> GatewayResult<ChannelRecord> {
    let store = state.store.clone();
    let id = channel_id.to_string();
    let channel = tokio::task::spawn_blocking(move || store.get_channel(&id))
        .await
        .map_err(|err| GatewayError::Persistence(err.to_string()))?
        .map_err(|err| {
            error!("gateway channel lookup failed channel={}: {}", channel_id, err);
            GatewayError::Persistence(err.to_string())
        })?;
    channel.ok_or(GatewayError::ChannelNotFound)
}

/// The channel must exist and be bound to the provider named in the path.
async fn load_channel_for_path(
    state: &GatewayState,
    provider: &str,
    channel_id: &str,
) -> GatewayResult<ChannelRecord> {
    let provider: Provider = provider.parse().map_err(|_| GatewayError::ChannelNotFound)?;
    let channel = load_channel(state, channel_id).await?;
    if channel.provider != provider {
        warn!(
            "gateway provider mismatch channel={} path={} bound={}",
            channel_id, provider, channel.provider
        );
        return Err(GatewayError::ChannelNotFound);
    }
    Ok(channel)
}

/// Cloud API subscription handshake (`hub.mode`, `hub.verify_token`,
/// `hub.challenge`). Only WhatsApp channels answer it.
pub(super) async fn verify_subscription(
    State(state): State<Arc<GatewayState>>,
    Path((provider, channel_id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> GatewayResult<(StatusCode, String)> {
    let channel = load_channel_for_path(&state, &provider, &channel_id).await?;
    if channel.provider != Provider::WhatsApp {
        return Err(GatewayError::ChannelNotFound);
    }

    let challenge = verify_whatsapp_subscription(
        channel.credentials.verify_token.as_deref(),
        params.get("hub.mode").map(String::as_str),
        params.get("hub.verify_token").map(String::as_str),
        params.get("hub.challenge").map(String::as_str),
    )
    .map_err(GatewayError::Forbidden)?;

    state.registry.mark_webhook_verified(&channel.id).await?;
    Ok((StatusCode::OK, challenge))
}

fn authorize_admin(state: &GatewayState, headers: &HeaderMap) -> GatewayResult<()> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Ok(());
    };
    let provided = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(GatewayError::Unauthorized("missing_token"))?;
    if provided.trim() != expected {
        return Err(GatewayError::Unauthorized("invalid_token"));
    }
    Ok(())
}

pub(super) async fn channel_status(
    State(state): State<Arc<GatewayState>>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
) -> GatewayResult<Json<ChannelStatusView>> {
    authorize_admin(&state, &headers)?;
    Ok(Json(state.registry.status_view(&channel_id).await?))
}

pub(super) async fn connect_channel(
    State(state): State<Arc<GatewayState>>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
) -> GatewayResult<Json<ChannelStatusView>> {
    authorize_admin(&state, &headers)?;
    Ok(Json(state.registry.connect(&channel_id).await?))
}

pub(super) async fn disconnect_channel(
    State(state): State<Arc<GatewayState>>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
) -> GatewayResult<Json<ChannelStatusView>> {
    authorize_admin(&state, &headers)?;
    Ok(Json(state.registry.disconnect(&channel_id).await?))
}
