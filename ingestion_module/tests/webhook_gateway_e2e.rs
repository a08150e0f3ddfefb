mod test_support;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;

use ingestion_module::channel::{ChannelCredentials, ChannelRecord, ChannelStatus, Provider};
use ingestion_module::gateway::verify::sign_sha256;
use ingestion_module::gateway::RateLimiter;
use ingestion_module::ingestion::MessageRole;
use ingestion_module::outbox::OutboxEventType;

use test_support::{GatewayOptions, TestGateway, UnreachableCache};

const QR_MESSAGE: &str = r#"{"event": "messages.upsert", "messages": [{"key": {"id": "m1", "remoteJid": "s1"}, "text": "hi"}]}"#;

fn qr_channel() -> ChannelRecord {
    ChannelRecord::new("wa-qr-1", Provider::WhatsAppQr, "m1", ChannelCredentials::default())
}

fn generic_channel(secret: Option<&str>) -> ChannelRecord {
    ChannelRecord::new(
        "web-1",
        Provider::Generic,
        "m1",
        ChannelCredentials {
            webhook_secret: secret.map(str::to_string),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn qr_message_delivered_twice_is_stored_once() {
    let gateway = TestGateway::new(&[qr_channel()]);

    let (status, body) = gateway.post_json("/webhooks/whatsapp_qr/wa-qr-1", QR_MESSAGE, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["sessionId"], "s1");
    assert_eq!(gateway.store.count_messages("wa-qr-1").unwrap(), 1);

    let (status, body) = gateway.post_json("/webhooks/whatsapp_qr/wa-qr-1", QR_MESSAGE, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "duplicate_ignored");
    assert_eq!(body["sessionId"], "s1");
    assert_eq!(body["messageId"], "m1");
    assert_eq!(gateway.store.count_messages("wa-qr-1").unwrap(), 1);
    assert_eq!(gateway.store.count_inbound_events("wa-qr-1").unwrap(), 1);
}

#[tokio::test]
async fn generic_incoming_event_writes_message_audit_and_outbox() {
    let gateway = TestGateway::new(&[generic_channel(None)]);
    let payload = r#"{"event": "incoming", "merchantId": "m1", "from": "s1", "messageText": "hello"}"#;

    let (status, body) = gateway.post_json("/webhooks/generic/web-1", payload, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "accepted");
    assert!(body.get("messageId").is_none());

    let store = &gateway.store;
    assert_eq!(store.count_inbound_events("web-1").unwrap(), 1);
    let messages = store.list_session_messages("web-1", "s1").unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message.role, MessageRole::Customer);
    assert_eq!(messages[0].message.text, "hello");

    let outbox = store.list_outbox("web-1:s1").unwrap();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].event_type, OutboxEventType::ChatIncoming);
    assert_eq!(outbox[0].routing_key, "generic");
    assert!(!outbox[0].is_published());
}

#[tokio::test]
async fn status_callbacks_drive_channel_state() {
    let gateway = TestGateway::new(&[qr_channel()]);
    let uri = "/webhooks/whatsapp_qr/wa-qr-1/connection.update";

    let (status, body) = gateway.post_json(uri, r#"{"state": "open"}"#, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["channelStatus"], "connected");
    assert_eq!(gateway.channel("wa-qr-1").status, ChannelStatus::Connected);

    let (_, body) = gateway.post_json(uri, r#"{"state": "close"}"#, &[]).await;
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["channelStatus"], "disconnected");
    assert_eq!(gateway.channel("wa-qr-1").status, ChannelStatus::Disconnected);

    let (status, body) = gateway.post_json(uri, r#"{"state": "syncing_history"}"#, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
    assert_eq!(body["channelStatus"], "disconnected");
    assert_eq!(gateway.channel("wa-qr-1").status, ChannelStatus::Disconnected);

    // every callback is audited, including the unmapped one
    assert_eq!(gateway.store.count_inbound_events("wa-qr-1").unwrap(), 3);
    assert_eq!(gateway.store.count_messages("wa-qr-1").unwrap(), 0);
}

#[tokio::test]
async fn bad_signature_is_rejected_before_anything_is_written() {
    let gateway = TestGateway::new(&[generic_channel(Some("k"))]);
    let payload = r#"{"from": "s1", "messageText": "hello", "messageId": "g-1"}"#;

    let wrong = sign_sha256("not-the-secret", payload.as_bytes());
    let (status, body) = gateway
        .post_json("/webhooks/generic/web-1", payload, &[("x-webhook-signature", wrong.as_str())])
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], "invalid_signature");

    let (status, _) = gateway.post_json("/webhooks/generic/web-1", payload, &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(gateway.store.count_inbound_events("web-1").unwrap(), 0);
    assert_eq!(gateway.store.count_messages("web-1").unwrap(), 0);

    let good = sign_sha256("k", payload.as_bytes());
    let (status, body) = gateway
        .post_json("/webhooks/generic/web-1", payload, &[("x-webhook-signature", good.as_str())])
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "accepted");
}

#[tokio::test]
async fn malformed_payload_returns_400_and_writes_nothing() {
    let gateway = TestGateway::new(&[generic_channel(None)]);

    let (status, body) = gateway
        .post_json("/webhooks/generic/web-1", r#"{"from": "s1"}"#, &[])
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "invalid_payload");

    let (status, _) = gateway.post_json("/webhooks/generic/web-1", "not json", &[]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(gateway.store.count_inbound_events("web-1").unwrap(), 0);
    assert!(gateway.store.list_outbox("web-1:s1").unwrap().is_empty());
}

#[tokio::test]
async fn payload_claiming_another_merchant_is_forbidden() {
    let gateway = TestGateway::new(&[generic_channel(None)]);
    let payload = r#"{"merchantId": "m2", "from": "s1", "messageText": "hello"}"#;

    let (status, body) = gateway.post_json("/webhooks/generic/web-1", payload, &[]).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["status"], "merchant_mismatch");
    assert_eq!(gateway.store.count_messages("web-1").unwrap(), 0);
}

#[tokio::test]
async fn unknown_channel_or_wrong_provider_is_404() {
    let gateway = TestGateway::new(&[generic_channel(None)]);
    let payload = r#"{"from": "s1", "messageText": "hello"}"#;

    let (status, body) = gateway.post_json("/webhooks/generic/missing", payload, &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "unknown_channel");

    let (status, _) = gateway.post_json("/webhooks/telegram/web-1", payload, &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = gateway.post_json("/webhooks/sms/web-1", payload, &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn requests_over_the_channel_budget_get_429() {
    let gateway = TestGateway::with_options(
        &[generic_channel(None)],
        GatewayOptions {
            limiter: RateLimiter::new(Duration::from_secs(60), 2),
            ..GatewayOptions::default()
        },
    );
    let payload = r#"{"from": "s1", "messageText": "hello"}"#;

    for _ in 0..2 {
        let (status, _) = gateway.post_json("/webhooks/generic/web-1", payload, &[]).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) = gateway.post_json("/webhooks/generic/web-1", payload, &[]).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["status"], "rate_limited");
    assert_eq!(gateway.store.count_messages("web-1").unwrap(), 2);
}

#[tokio::test]
async fn unreachable_cache_fails_open() {
    let gateway = TestGateway::with_options(
        &[qr_channel()],
        GatewayOptions {
            cache: Arc::new(UnreachableCache),
            ..GatewayOptions::default()
        },
    );

    for _ in 0..2 {
        let (status, body) = gateway.post_json("/webhooks/whatsapp_qr/wa-qr-1", QR_MESSAGE, &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "accepted");
    }
    // downstream consumers absorb the duplicate
    assert_eq!(gateway.store.count_messages("wa-qr-1").unwrap(), 2);
}

#[tokio::test]
async fn persistence_failure_returns_500_and_releases_the_key() {
    let gateway = TestGateway::new(&[qr_channel()]);
    let conn = rusqlite::Connection::open(&gateway.db_path).unwrap();
    conn.execute_batch(
        "CREATE TRIGGER outbox_down BEFORE INSERT ON outbox_entries
         BEGIN SELECT RAISE(ABORT, 'outbox unavailable'); END;",
    )
    .unwrap();

    let (status, body) = gateway.post_json("/webhooks/whatsapp_qr/wa-qr-1", QR_MESSAGE, &[]).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["status"], "persistence_failed");
    assert_eq!(gateway.store.count_messages("wa-qr-1").unwrap(), 0);
    assert_eq!(gateway.store.count_inbound_events("wa-qr-1").unwrap(), 0);
    assert!(gateway.store.get_session("wa-qr-1", "s1").unwrap().is_none());

    conn.execute_batch("DROP TRIGGER outbox_down;").unwrap();
    let (status, body) = gateway.post_json("/webhooks/whatsapp_qr/wa-qr-1", QR_MESSAGE, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "accepted");
    assert_eq!(gateway.store.count_messages("wa-qr-1").unwrap(), 1);
}

#[tokio::test]
async fn telegram_updates_without_messages_are_ignored() {
    let channel = ChannelRecord::new(
        "tg-1",
        Provider::Telegram,
        "m1",
        ChannelCredentials {
            webhook_secret: Some("s3cret".to_string()),
            ..Default::default()
        },
    );
    let gateway = TestGateway::new(&[channel]);
    let headers = [("x-telegram-bot-api-secret-token", "s3cret")];

    let (status, body) = gateway
        .post_json("/webhooks/telegram/tg-1", r#"{"update_id": 7, "my_chat_member": {}}"#, &headers)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
    assert_eq!(gateway.store.count_inbound_events("tg-1").unwrap(), 1);
    assert_eq!(gateway.store.count_messages("tg-1").unwrap(), 0);

    let update = r#"{"update_id": 8, "message": {"message_id": 5, "date": 1700000000,
        "from": {"id": 42, "is_bot": false, "first_name": "Ana"},
        "chat": {"id": 42, "type": "private"}, "text": "is this in stock?"}}"#;
    let (status, body) = gateway.post_json("/webhooks/telegram/tg-1", update, &headers).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessionId"], "42");
    assert_eq!(body["messageId"], "42:5");
    assert_eq!(gateway.store.count_inbound_events("tg-1").unwrap(), 2);
}

#[tokio::test]
async fn bare_delivery_failure_keeps_qr_session_connected() {
    let mut channel = qr_channel();
    channel.status = ChannelStatus::Connected;
    let gateway = TestGateway::new(&[channel]);

    let (status, body) = gateway
        .post_json("/webhooks/whatsapp_qr/wa-qr-1", r#"{"status": "failed", "id": "m7"}"#, &[])
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
    assert_eq!(body["reason"], "message_status");
    assert_eq!(gateway.channel("wa-qr-1").status, ChannelStatus::Connected);
    assert_eq!(gateway.store.count_inbound_events("wa-qr-1").unwrap(), 1);

    let (_, body) = gateway
        .post_json("/webhooks/whatsapp_qr/wa-qr-1/connection.update", r#"{"state": "failed"}"#, &[])
        .await;
    assert_eq!(body["channelStatus"], "disconnected");
    assert_eq!(gateway.channel("wa-qr-1").status, ChannelStatus::Disconnected);
}

#[tokio::test]
async fn health_answers_ok() {
    let gateway = TestGateway::new(&[]);
    let (status, body) = gateway.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}
