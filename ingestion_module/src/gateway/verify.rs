use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

use crate::channel::{ChannelRecord, Provider};

const TELEGRAM_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";
const META_SIGNATURE_HEADER: &str = "x-hub-signature-256";
const GENERIC_SIGNATURE_HEADER: &str = "x-webhook-signature";

fn configured(secret: Option<&str>) -> Option<&str> {
    secret.map(str::trim).filter(|value| !value.is_empty())
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Checks the request against the scheme of the channel's provider. A
/// channel without a secret for its scheme accepts unsigned requests.
pub fn verify_webhook(channel: &ChannelRecord, headers: &HeaderMap, body: &[u8]) -> Result<(), &'static str> {
    let credentials = &channel.credentials;
    let result = match channel.provider {
        Provider::Telegram => verify_telegram(configured(credentials.webhook_secret.as_deref()), headers),
        Provider::WhatsApp => verify_hmac_sha256(
            configured(credentials.app_secret.as_deref()),
            header(headers, META_SIGNATURE_HEADER),
            body,
        ),
        Provider::WhatsAppQr => verify_qr_gateway(configured(credentials.api_key.as_deref()), headers),
        Provider::Generic => verify_hmac_sha256(
            configured(credentials.webhook_secret.as_deref()),
            header(headers, GENERIC_SIGNATURE_HEADER),
            body,
        ),
    };
    if result.is_ok() && !has_secret(channel) {
        debug!("accepting unsigned webhook channel={} provider={}", channel.id, channel.provider);
    }
    result
}

fn has_secret(channel: &ChannelRecord) -> bool {
    let credentials = &channel.credentials;
    let secret = match channel.provider {
        Provider::Telegram | Provider::Generic => credentials.webhook_secret.as_deref(),
        Provider::WhatsApp => credentials.app_secret.as_deref(),
        Provider::WhatsAppQr => credentials.api_key.as_deref(),
    };
    configured(secret).is_some()
}

fn verify_telegram(secret: Option<&str>, headers: &HeaderMap) -> Result<(), &'static str> {
    let Some(secret) = secret else {
        return Ok(());
    };
    let provided = header(headers, TELEGRAM_SECRET_HEADER).ok_or("missing_token")?;
    if provided != secret {
        return Err("invalid_token");
    }
    Ok(())
}

/// `signature` has the form `sha256=<hex>`.
fn verify_hmac_sha256(secret: Option<&str>, signature: Option<&str>, body: &[u8]) -> Result<(), &'static str> {
    let Some(secret) = secret else {
        return Ok(());
    };
    let signature = signature.ok_or("missing_signature")?;
    let hex_digest = signature
        .trim()
        .strip_prefix("sha256=")
        .ok_or("invalid_signature")?;
    let expected = hex::decode(hex_digest).map_err(|_| "invalid_signature")?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| "bad_secret")?;
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| "invalid_signature")
}

fn verify_qr_gateway(api_key: Option<&str>, headers: &HeaderMap) -> Result<(), &'static str> {
    let Some(api_key) = api_key else {
        return Ok(());
    };
    let provided = header(headers, "apikey")
        .or_else(|| header(headers, "authorization").and_then(|value| value.strip_prefix("Bearer ")))
        .ok_or("missing_token")?;
    if provided.trim() != api_key {
        return Err("invalid_token");
    }
    Ok(())
}

/// Cloud API subscription handshake. Returns the challenge to echo back.
pub fn verify_whatsapp_subscription(
    expected_token: Option<&str>,
    mode: Option<&str>,
    token: Option<&str>,
    challenge: Option<&str>,
) -> Result<String, &'static str> {
    let expected = configured(expected_token).ok_or("verify_token_not_configured")?;

    if mode != Some("subscribe") {
        return Err("invalid_mode");
    }

    let provided_token = token.ok_or("missing_token")?;
    if provided_token != expected {
        return Err("token_mismatch");
    }

    challenge.map(|c| c.to_string()).ok_or("missing_challenge")
}

/// Signs `body` the way generic webhook senders and Meta do.
pub fn sign_sha256(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelCredentials;
    use axum::http::HeaderValue;

    fn channel(provider: Provider, credentials: ChannelCredentials) -> ChannelRecord {
        ChannelRecord::new("c1", provider, "m1", credentials)
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn generic_hmac_signature() {
        let body = br#"{"from":"s1","messageText":"hi"}"#;
        let channel = channel(
            Provider::Generic,
            ChannelCredentials {
                webhook_secret: Some("k".to_string()),
                ..Default::default()
            },
        );
        let good = sign_sha256("k", body);
        assert!(verify_webhook(&channel, &headers(&[(GENERIC_SIGNATURE_HEADER, good.as_str())]), body).is_ok());
        assert_eq!(
            verify_webhook(&channel, &headers(&[(GENERIC_SIGNATURE_HEADER, sign_sha256("other", body).as_str())]), body),
            Err("invalid_signature")
        );
        assert_eq!(verify_webhook(&channel, &HeaderMap::new(), body), Err("missing_signature"));
        assert_eq!(
            verify_webhook(&channel, &headers(&[(GENERIC_SIGNATURE_HEADER, "sha256=zz")]), body),
            Err("invalid_signature")
        );
    }

    #[test]
    fn meta_signature_uses_app_secret() {
        let body = b"{}";
        let channel = channel(
            Provider::WhatsApp,
            ChannelCredentials {
                app_secret: Some("meta".to_string()),
                ..Default::default()
            },
        );
        let signature = sign_sha256("meta", body);
        assert!(verify_webhook(&channel, &headers(&[(META_SIGNATURE_HEADER, signature.as_str())]), body).is_ok());
        assert!(verify_webhook(&channel, &headers(&[(META_SIGNATURE_HEADER, signature.as_str())]), b"{ }").is_err());
    }

    #[test]
    fn telegram_and_qr_tokens() {
        let telegram = channel(
            Provider::Telegram,
            ChannelCredentials {
                webhook_secret: Some("s3cret".to_string()),
                ..Default::default()
            },
        );
        assert!(verify_webhook(&telegram, &headers(&[(TELEGRAM_SECRET_HEADER, "s3cret")]), b"").is_ok());
        assert_eq!(
            verify_webhook(&telegram, &headers(&[(TELEGRAM_SECRET_HEADER, "nope")]), b""),
            Err("invalid_token")
        );

        let qr = channel(
            Provider::WhatsAppQr,
            ChannelCredentials {
                api_key: Some("gw-key".to_string()),
                ..Default::default()
            },
        );
        assert!(verify_webhook(&qr, &headers(&[("apikey", "gw-key")]), b"").is_ok());
        assert!(verify_webhook(&qr, &headers(&[("authorization", "Bearer gw-key")]), b"").is_ok());
        assert_eq!(verify_webhook(&qr, &HeaderMap::new(), b""), Err("missing_token"));
    }

    #[test]
    fn unsigned_requests_pass_without_secret() {
        let channel = channel(Provider::Generic, ChannelCredentials::default());
        assert!(verify_webhook(&channel, &HeaderMap::new(), b"{}").is_ok());
    }

    #[test]
    fn subscription_handshake() {
        assert_eq!(
            verify_whatsapp_subscription(Some("vt"), Some("subscribe"), Some("vt"), Some("42")),
            Ok("42".to_string())
        );
        assert_eq!(
            verify_whatsapp_subscription(Some("vt"), Some("subscribe"), Some("x"), Some("42")),
            Err("token_mismatch")
        );
        assert_eq!(
            verify_whatsapp_subscription(None, Some("subscribe"), Some("vt"), Some("42")),
            Err("verify_token_not_configured")
        );
        assert_eq!(
            verify_whatsapp_subscription(Some("vt"), Some("unsubscribe"), Some("vt"), Some("42")),
            Err("invalid_mode")
        );
    }
}
