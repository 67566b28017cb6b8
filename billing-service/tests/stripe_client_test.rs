//! Stripe client tests backed by a wiremock server. These run without a
//! database.

use billing_service::config::StripeConfig;
use billing_service::services::StripeClient;
use secrecy::Secret;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(base_url: &str) -> StripeClient {
    StripeClient::new(StripeConfig {
        secret_key: Secret::new("sk_test_abc".to_string()),
        webhook_secret: Secret::new("whsec_test_secret".to_string()),
        api_base_url: base_url.to_string(),
        success_url: "http://localhost:3000/invoices/paid".to_string(),
        cancel_url: "http://localhost:3000/invoices".to_string(),
    })
}

#[tokio::test]
async fn checkout_session_request_carries_payment_metadata() {
    let server = MockServer::start().await;
    let payment_id = Uuid::new_v4();
    let invoice_id = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path("/checkout/sessions"))
        .and(header("Authorization", "Bearer sk_test_abc"))
        .and(body_string_contains("mode=payment"))
        .and(body_string_contains(&payment_id.to_string()))
        .and(body_string_contains(&invoice_id.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cs_test_42",
            "url": "https://checkout.stripe.test/pay/cs_test_42",
            "payment_intent": null,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server.uri());
    let session = client
        .create_checkout_session(4898, "USD", "Invoice 42", payment_id, invoice_id)
        .await
        .expect("checkout session should be created");

    assert_eq!(session.id, "cs_test_42");
    assert_eq!(
        session.url.as_deref(),
        Some("https://checkout.stripe.test/pay/cs_test_42")
    );
    assert!(session.payment_intent.is_none());
}

#[tokio::test]
async fn checkout_currency_is_lowercased_for_the_provider() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/checkout/sessions"))
        .and(body_string_contains("currency%5D=usd"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "cs_1"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server.uri());
    client
        .create_checkout_session(100, "USD", "Invoice", Uuid::new_v4(), Uuid::new_v4())
        .await
        .expect("checkout session should be created");
}

#[tokio::test]
async fn provider_error_message_is_surfaced() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/checkout/sessions"))
        .respond_with(ResponseTemplate::new(402).set_body_json(json!({
            "error": {"message": "Your card has insufficient funds."},
        })))
        .mount(&server)
        .await;

    let client = client_for(&server.uri());
    let err = client
        .create_checkout_session(100, "usd", "Invoice", Uuid::new_v4(), Uuid::new_v4())
        .await
        .expect_err("checkout should fail");

    assert!(err.to_string().contains("Your card has insufficient funds."));
}

#[tokio::test]
async fn fetch_charge_reads_cumulative_refund_total() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/charges/ch_55"))
        .and(header("Authorization", "Bearer sk_test_abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "ch_55",
            "amount": 10000,
            "amount_refunded": 2500,
            "payment_intent": "pi_55",
            "refunded": false,
        })))
        .mount(&server)
        .await;

    let client = client_for(&server.uri());
    let charge = client
        .fetch_charge("ch_55")
        .await
        .expect("charge fetch should succeed");

    assert_eq!(charge.id, "ch_55");
    assert_eq!(charge.amount, 10000);
    assert_eq!(charge.amount_refunded, 2500);
    assert!(!charge.refunded);
}

#[tokio::test]
async fn unconfigured_client_fails_fast() {
    let client = StripeClient::new(StripeConfig {
        secret_key: Secret::new(String::new()),
        webhook_secret: Secret::new(String::new()),
        api_base_url: "https://api.stripe.com/v1".to_string(),
        success_url: "http://localhost:3000/invoices/paid".to_string(),
        cancel_url: "http://localhost:3000/invoices".to_string(),
    });

    assert!(!client.is_configured());

    let err = client
        .create_checkout_session(100, "usd", "Invoice", Uuid::new_v4(), Uuid::new_v4())
        .await
        .expect_err("unconfigured checkout must fail");
    assert!(err.to_string().contains("not configured"));

    let err = client
        .fetch_charge("ch_1")
        .await
        .expect_err("unconfigured fetch must fail");
    assert!(err.to_string().contains("not configured"));
}
