use std::time::Duration;

use blogsmith_backend::billing::{ChargeRequest, GatewayError, HttpPaymentGateway, PaymentGateway};
use httpmock::prelude::*;
use serde_json::json;
use uuid::Uuid;

// key: gateway-tests -> idempotency-header,decline-mapping,timeouts

fn sample_charge() -> ChargeRequest {
    ChargeRequest {
        user_id: 7,
        amount_cents: 2000,
        payer_token: "tok_visa".to_string(),
        memo: "credit purchase".to_string(),
        idempotency_key: Uuid::new_v4(),
    }
}

#[tokio::test]
async fn successful_charges_parse_the_receipt() {
    let server = MockServer::start_async().await;

    let charge_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/charges")
            .header("authorization", "Bearer secret-token")
            .header_exists("Idempotency-Key")
            .json_body_partial(r#"{"amount_cents": 2000, "payer_token": "tok_visa"}"#);
        then.status(200).json_body(json!({
            "transaction_ref": "tx-abc",
            "message": "approved",
        }));
    });

    let gateway = HttpPaymentGateway::new(
        &server.base_url(),
        Some("secret-token".to_string()),
        Duration::from_secs(2),
    )
    .unwrap();
    let receipt = gateway.charge(&sample_charge()).await.unwrap();

    assert_eq!(receipt.transaction_ref, "tx-abc");
    assert_eq!(receipt.message.as_deref(), Some("approved"));
    charge_mock.assert();
}

#[tokio::test]
async fn client_errors_map_to_declines() {
    let server = MockServer::start_async().await;

    let charge_mock = server.mock(|when, then| {
        when.method(POST).path("/charges");
        then.status(402).json_body(json!({
            "message": "card expired",
        }));
    });

    let gateway =
        HttpPaymentGateway::new(&server.base_url(), None, Duration::from_secs(2)).unwrap();
    let result = gateway.charge(&sample_charge()).await;

    match result {
        Err(GatewayError::Declined(reason)) => assert_eq!(reason, "card expired"),
        other => panic!("expected a decline, got {other:?}"),
    }
    charge_mock.assert();
}

#[tokio::test]
async fn server_errors_map_to_unavailable() {
    let server = MockServer::start_async().await;

    let charge_mock = server.mock(|when, then| {
        when.method(POST).path("/charges");
        then.status(503).body("scheduled maintenance");
    });

    let gateway =
        HttpPaymentGateway::new(&server.base_url(), None, Duration::from_secs(2)).unwrap();
    let result = gateway.charge(&sample_charge()).await;

    match result {
        Err(GatewayError::Unavailable { status, message }) => {
            assert_eq!(status, 503);
            assert_eq!(message, "scheduled maintenance");
        }
        other => panic!("expected unavailable, got {other:?}"),
    }
    charge_mock.assert();
}

#[tokio::test]
async fn slow_gateways_time_out() {
    let server = MockServer::start_async().await;

    server.mock(|when, then| {
        when.method(POST).path("/charges");
        then.status(200)
            .json_body(json!({"transaction_ref": "tx-late"}))
            .delay(Duration::from_secs(2));
    });

    let gateway =
        HttpPaymentGateway::new(&server.base_url(), None, Duration::from_millis(200)).unwrap();
    let result = gateway.charge(&sample_charge()).await;

    assert!(matches!(result, Err(GatewayError::Timeout)));
}
