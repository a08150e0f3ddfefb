use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{error, warn};

use crate::adapters::AdapterError;
use crate::channel_registry::RegistryError;
use crate::connectors::ConnectError;
use crate::ingestion::MerchantMismatch;

/// Request failures surfaced to the caller as `{"status": <code>}`.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("unknown channel")]
    ChannelNotFound,
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] AdapterError),
    #[error(transparent)]
    MerchantMismatch(#[from] MerchantMismatch),
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("provider connect failed: {0}")]
    Connect(#[from] ConnectError),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ChannelNotFound => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) | GatewayError::MerchantMismatch(_) => StatusCode::FORBIDDEN,
            GatewayError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            GatewayError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Connect(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::RateLimited => "rate_limited",
            GatewayError::ChannelNotFound => "unknown_channel",
            GatewayError::Unauthorized(reason) | GatewayError::Forbidden(reason) => *reason,
            GatewayError::InvalidPayload(_) => "invalid_payload",
            GatewayError::MerchantMismatch(_) => "merchant_mismatch",
            GatewayError::Persistence(_) => "persistence_failed",
            GatewayError::Connect(_) => "provider_connect_failed",
        }
    }
}

impl From<RegistryError> for GatewayError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => GatewayError::ChannelNotFound,
            RegistryError::Connect(err) => GatewayError::Connect(err),
            RegistryError::Store(err) => GatewayError::Persistence(err.to_string()),
            RegistryError::Join(err) => GatewayError::Persistence(err),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("gateway request failed: {}", self);
        } else {
            warn!("gateway request rejected: {}", self);
        }
        (status, Json(json!({ "status": self.code() }))).into_response()
    }
}
