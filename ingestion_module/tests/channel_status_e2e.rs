mod test_support;

use std::sync::Arc;

use axum::http::StatusCode;
use serde_json::json;

use ingestion_module::channel::{ChannelCredentials, ChannelRecord, ChannelStatus, Provider};
use ingestion_module::connectors::ProviderConnector;

use test_support::{GatewayOptions, TestGateway, PUBLIC_BASE_URL};

fn qr_channel(gateway_url: &str) -> ChannelRecord {
    ChannelRecord::new(
        "wa-qr-1",
        Provider::WhatsAppQr,
        "m1",
        ChannelCredentials {
            api_key: Some("gw-key".to_string()),
            gateway_url: Some(gateway_url.to_string()),
            session_name: Some("shop-1".to_string()),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn qr_connect_exposes_code_until_the_session_pairs() {
    let mut server = mockito::Server::new_async().await;
    let connect = server
        .mock("POST", "/sessions/shop-1/connect")
        .match_header("apikey", "gw-key")
        .with_status(200)
        .with_body(r#"{"qrcode": "2@abc", "state": "SCAN_QR_CODE"}"#)
        .create_async()
        .await;
    let gateway = TestGateway::new(&[qr_channel(&server.url())]);

    let (status, view) = gateway.post_json("/channels/wa-qr-1/connect", "", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        view,
        json!({
            "channelId": "wa-qr-1",
            "provider": "whatsapp_qr",
            "status": "pending",
            "details": {
                "webhookUrl": format!("{}/webhooks/whatsapp_qr/wa-qr-1", PUBLIC_BASE_URL),
                "qr": "2@abc"
            }
        })
    );
    connect.assert_async().await;

    let (_, bytes) = gateway.get("/channels/wa-qr-1/status").await;
    let polled: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(polled["details"]["qr"], "2@abc");

    let (status, _) = gateway
        .post_json("/webhooks/whatsapp_qr/wa-qr-1", r#"{"event": "connection.update", "state": "open"}"#, &[("apikey", "gw-key")])
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, bytes) = gateway.get("/channels/wa-qr-1/status").await;
    let polled: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(polled["status"], "connected");
    assert!(polled["details"].get("qr").is_none());
    assert_eq!(gateway.channel("wa-qr-1").qr_payload, None);
}

#[tokio::test]
async fn failed_provider_connect_is_502_and_channel_stays_disconnected() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/sessions/shop-1/connect")
        .with_status(500)
        .with_body("instance crashed")
        .create_async()
        .await;
    let gateway = TestGateway::new(&[qr_channel(&server.url())]);

    let (status, body) = gateway.post_json("/channels/wa-qr-1/connect", "", &[]).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["status"], "provider_connect_failed");
    assert_eq!(gateway.channel("wa-qr-1").status, ChannelStatus::Disconnected);
}

#[tokio::test]
async fn telegram_disconnect_deletes_webhook() {
    let mut server = mockito::Server::new_async().await;
    let delete = server
        .mock("POST", "/bot123:abc/deleteWebhook")
        .with_status(200)
        .with_body(r#"{"ok": true, "result": true}"#)
        .create_async()
        .await;

    let mut channel = ChannelRecord::new(
        "tg-1",
        Provider::Telegram,
        "m1",
        ChannelCredentials {
            bot_token: Some("123:abc".to_string()),
            ..Default::default()
        },
    );
    channel.status = ChannelStatus::Connected;
    let gateway = TestGateway::with_options(
        &[channel],
        GatewayOptions {
            connector: Arc::new(ProviderConnector::new(Some(&server.url())).unwrap()),
            ..GatewayOptions::default()
        },
    );

    let (status, view) = gateway.post_json("/channels/tg-1/disconnect", "", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "disconnected");
    delete.assert_async().await;
}

#[tokio::test]
async fn cloud_api_verification_connects_the_channel() {
    let channel = ChannelRecord::new(
        "wa-1",
        Provider::WhatsApp,
        "m1",
        ChannelCredentials {
            verify_token: Some("vt".to_string()),
            ..Default::default()
        },
    );
    let gateway = TestGateway::new(&[channel, ChannelRecord::new("web-1", Provider::Generic, "m1", Default::default())]);

    let (status, body) = gateway
        .get("/webhooks/whatsapp/wa-1?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=123")
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(serde_json::from_slice::<serde_json::Value>(&body).unwrap()["status"], "token_mismatch");
    assert_eq!(gateway.channel("wa-1").status, ChannelStatus::Disconnected);

    let (status, body) = gateway
        .get("/webhooks/whatsapp/wa-1?hub.mode=subscribe&hub.verify_token=vt&hub.challenge=123")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"123");
    assert_eq!(gateway.channel("wa-1").status, ChannelStatus::Connected);

    let (status, _) = gateway
        .get("/webhooks/generic/web-1?hub.mode=subscribe&hub.verify_token=vt&hub.challenge=1")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn management_endpoints_require_admin_token_when_configured() {
    let gateway = TestGateway::with_options(
        &[ChannelRecord::new("web-1", Provider::Generic, "m1", Default::default())],
        GatewayOptions {
            admin_token: Some("admin".to_string()),
            ..GatewayOptions::default()
        },
    );

    let (status, _) = gateway.get("/channels/web-1/status").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, view) = gateway
        .post_json("/channels/web-1/connect", "", &[("authorization", "Bearer admin")])
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "connected");

    let (status, body) = gateway
        .post_json("/channels/missing/disconnect", "", &[("authorization", "Bearer admin")])
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "unknown_channel");
}
