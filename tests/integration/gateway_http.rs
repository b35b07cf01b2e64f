//! HTTP-level tests for the acknowledgment gateway

use std::sync::Arc;

use alerting_platform::broker::memory::InProcessBroker;
use alerting_platform::broker::{topics, Broker};
use alerting_platform::gateway::{spawn_gateway, GatewayState, RESOLVE_ENDPOINT_PATH};
use alerting_platform::token::TokenCodec;
use tokio_util::sync::CancellationToken;

use crate::helpers::{expect_event, expect_silence};

const SECRET: &str = "gateway-test-secret";

struct Gateway {
    broker: Arc<InProcessBroker>,
    base_url: String,
    cancel: CancellationToken,
}

async fn start_gateway() -> Gateway {
    let broker = Arc::new(InProcessBroker::new());
    let state = GatewayState::new(broker.clone(), Arc::new(TokenCodec::new(SECRET)));

    let cancel = CancellationToken::new();
    let addr = spawn_gateway("127.0.0.1:0".parse().unwrap(), state, cancel.clone())
        .await
        .unwrap();

    Gateway {
        broker,
        base_url: format!("http://{addr}"),
        cancel,
    }
}

/// Happy path: a valid token publishes the acknowledgment
#[tokio::test]
async fn valid_token_publishes_acknowledgment() {
    let gateway = start_gateway().await;
    let mut acks = gateway
        .broker
        .subscribe(topics::ONCALLER_ACKNOWLEDGED, "manager")
        .await
        .unwrap();

    let token = TokenCodec::new(SECRET).sign("1-100", 1, "b@x").unwrap();
    let response = reqwest::get(format!(
        "{}{RESOLVE_ENDPOINT_PATH}/{token}",
        gateway.base_url
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["message"], "Incident resolved successfully");

    let ack = expect_event(&mut acks).await;
    assert_eq!(ack.incident_id.as_deref(), Some("1-100"));
    assert_eq!(ack.service_id, Some(1));
    assert_eq!(ack.oncaller.as_deref(), Some("b@x"));

    gateway.cancel.cancel();
}

/// An invalid token is rejected and publishes nothing
#[tokio::test]
async fn invalid_token_is_rejected() {
    let gateway = start_gateway().await;
    let mut acks = gateway
        .broker
        .subscribe(topics::ONCALLER_ACKNOWLEDGED, "manager")
        .await
        .unwrap();

    let response = reqwest::get(format!(
        "{}{RESOLVE_ENDPOINT_PATH}/bad",
        gateway.base_url
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), 401);
    expect_silence(&mut acks).await;

    gateway.cancel.cancel();
}

/// A token signed with the wrong secret is rejected
#[tokio::test]
async fn wrong_secret_token_is_rejected() {
    let gateway = start_gateway().await;
    let mut acks = gateway
        .broker
        .subscribe(topics::ONCALLER_ACKNOWLEDGED, "manager")
        .await
        .unwrap();

    let forged = TokenCodec::new("other-secret").sign("1-100", 1, "b@x").unwrap();
    let response = reqwest::get(format!(
        "{}{RESOLVE_ENDPOINT_PATH}/{forged}",
        gateway.base_url
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), 401);
    expect_silence(&mut acks).await;

    gateway.cancel.cancel();
}

#[tokio::test]
async fn missing_token_is_a_bad_request() {
    let gateway = start_gateway().await;

    let bare = reqwest::get(format!("{}{RESOLVE_ENDPOINT_PATH}", gateway.base_url))
        .await
        .unwrap();
    assert_eq!(bare.status(), 400);

    let trailing = reqwest::get(format!("{}{RESOLVE_ENDPOINT_PATH}/", gateway.base_url))
        .await
        .unwrap();
    assert_eq!(trailing.status(), 400);

    gateway.cancel.cancel();
}

/// Token re-use is allowed at the HTTP layer; idempotency lives in the
/// incident manager
#[tokio::test]
async fn token_reuse_is_accepted() {
    let gateway = start_gateway().await;
    let mut acks = gateway
        .broker
        .subscribe(topics::ONCALLER_ACKNOWLEDGED, "manager")
        .await
        .unwrap();

    let token = TokenCodec::new(SECRET).sign("1-100", 1, "a@x").unwrap();
    let url = format!("{}{RESOLVE_ENDPOINT_PATH}/{token}", gateway.base_url);

    for _ in 0..2 {
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), 200);
        expect_event(&mut acks).await;
    }

    gateway.cancel.cancel();
}
