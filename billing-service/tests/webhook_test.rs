//! Webhook reconciliation integration tests for billing-service.
//!
//! Exercises the `/webhooks/stripe` endpoint end to end: signature
//! verification, payment row mutations and the owning invoice's paid state.
//! Refund tests stub the charge re-fetch with a wiremock server.

mod common;

use common::{create_test_invoice, seed_pending_payment, TestApp};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn session_event(event_type: &str, session: serde_json::Value) -> String {
    json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": event_type,
        "data": {"object": session},
    })
    .to_string()
}

/// Create a sent invoice for `amount` and seed a pending payment against it.
/// Returns `(invoice_id, payment_id)`.
async fn invoice_with_pending_payment(
    app: &TestApp,
    amount: &str,
    session_id: Option<&str>,
    intent_id: Option<&str>,
) -> (Uuid, Uuid) {
    let invoice = create_test_invoice(
        app,
        "sent",
        json!([{"description": "Services", "quantity": 1, "unit_price": amount}]),
    )
    .await;
    let invoice_id = Uuid::parse_str(invoice["invoice_id"].as_str().unwrap()).unwrap();
    let payment = seed_pending_payment(app, invoice_id, amount, session_id, intent_id).await;
    (invoice_id, payment.payment_id)
}

/// Drive a seeded payment to `succeeded` with a settled charge attached,
/// marking the invoice paid. Returns `(invoice_id, payment_id)`.
async fn paid_invoice_with_charge(
    app: &TestApp,
    amount: &str,
    intent_id: &str,
    charge_id: &str,
) -> (Uuid, Uuid) {
    let (invoice_id, payment_id) =
        invoice_with_pending_payment(app, amount, None, Some(intent_id)).await;

    let body = session_event(
        "payment_intent.succeeded",
        json!({"id": intent_id, "latest_charge": charge_id}),
    );
    let response = app.post_webhook(&body).await;
    assert_eq!(response.status().as_u16(), 200);

    let invoice = app.db.get_invoice(invoice_id).await.unwrap().unwrap();
    assert_eq!(invoice.status, "paid");

    (invoice_id, payment_id)
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn webhook_without_signature_is_rejected() {
    let app = TestApp::spawn().await;

    let response = Client::new()
        .post(format!("{}/webhooks/stripe", app.http_address))
        .header("content-type", "application/json")
        .body(r#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"object":{}}}"#)
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 401);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn webhook_with_bad_signature_is_rejected() {
    let app = TestApp::spawn().await;

    let response = Client::new()
        .post(format!("{}/webhooks/stripe", app.http_address))
        .header("Stripe-Signature", "t=1700000000,v1=deadbeef")
        .header("content-type", "application/json")
        .body(r#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"object":{}}}"#)
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 401);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn signed_but_malformed_payload_is_a_bad_request() {
    let app = TestApp::spawn().await;

    let response = app.post_webhook(r#"{"hello":"world"}"#).await;
    assert_eq!(response.status().as_u16(), 400);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn unhandled_event_type_is_acknowledged() {
    let app = TestApp::spawn().await;

    let body = session_event("customer.created", json!({"id": "cus_1"}));
    let response = app.post_webhook(&body).await;
    assert_eq!(response.status().as_u16(), 200);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn event_matching_no_payment_is_acknowledged_and_dropped() {
    let app = TestApp::spawn().await;

    let body = session_event("payment_intent.succeeded", json!({"id": "pi_nobody"}));
    let response = app.post_webhook(&body).await;
    assert_eq!(response.status().as_u16(), 200);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn session_completed_attaches_intent_and_customer() {
    let app = TestApp::spawn().await;

    let (invoice_id, payment_id) =
        invoice_with_pending_payment(&app, "100.00", Some("cs_123"), None).await;

    let body = session_event(
        "checkout.session.completed",
        json!({"id": "cs_123", "payment_intent": "pi_123", "customer": "cus_7"}),
    );
    let response = app.post_webhook(&body).await;
    assert_eq!(response.status().as_u16(), 200);

    let payment = app.db.get_payment(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.payment_intent_id.as_deref(), Some("pi_123"));
    assert_eq!(payment.customer_id.as_deref(), Some("cus_7"));
    // Completion is not settlement; the payment stays pending
    assert_eq!(payment.status, "pending");

    let invoice = app.db.get_invoice(invoice_id).await.unwrap().unwrap();
    assert_eq!(invoice.status, "sent");

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn metadata_payment_id_resolves_when_session_is_unknown() {
    let app = TestApp::spawn().await;

    let (_invoice_id, payment_id) =
        invoice_with_pending_payment(&app, "100.00", Some("cs_original"), None).await;

    let body = session_event(
        "checkout.session.completed",
        json!({
            "id": "cs_unknown",
            "payment_intent": "pi_meta",
            "metadata": {"paymentId": payment_id.to_string()},
        }),
    );
    let response = app.post_webhook(&body).await;
    assert_eq!(response.status().as_u16(), 200);

    let payment = app.db.get_payment(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.payment_intent_id.as_deref(), Some("pi_meta"));

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn intent_succeeded_marks_payment_and_invoice_paid() {
    let app = TestApp::spawn().await;

    let (invoice_id, payment_id) =
        invoice_with_pending_payment(&app, "100.00", None, Some("pi_9")).await;

    let body = session_event(
        "payment_intent.succeeded",
        json!({"id": "pi_9", "latest_charge": "ch_9"}),
    );
    let response = app.post_webhook(&body).await;
    assert_eq!(response.status().as_u16(), 200);

    let payment = app.db.get_payment(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, "succeeded");
    assert_eq!(payment.charge_id.as_deref(), Some("ch_9"));
    assert!(payment.paid_utc.is_some());

    let invoice = app.db.get_invoice(invoice_id).await.unwrap().unwrap();
    assert_eq!(invoice.status, "paid");

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn intent_failure_records_provider_reason() {
    let app = TestApp::spawn().await;

    let (invoice_id, payment_id) =
        invoice_with_pending_payment(&app, "100.00", None, Some("pi_f")).await;

    let body = session_event(
        "payment_intent.payment_failed",
        json!({
            "id": "pi_f",
            "last_payment_error": {"code": "card_declined", "message": "Your card was declined."},
        }),
    );
    let response = app.post_webhook(&body).await;
    assert_eq!(response.status().as_u16(), 200);

    let payment = app.db.get_payment(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, "failed");
    assert_eq!(payment.last_error.as_deref(), Some("Your card was declined."));

    let invoice = app.db.get_invoice(invoice_id).await.unwrap().unwrap();
    assert_eq!(invoice.status, "sent");

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn async_payment_failure_fails_the_session_payment() {
    let app = TestApp::spawn().await;

    let (_invoice_id, payment_id) =
        invoice_with_pending_payment(&app, "60.00", Some("cs_async"), None).await;

    let body = session_event(
        "checkout.session.async_payment_failed",
        json!({"id": "cs_async"}),
    );
    let response = app.post_webhook(&body).await;
    assert_eq!(response.status().as_u16(), 200);

    let payment = app.db.get_payment(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, "failed");
    assert_eq!(
        payment.last_error.as_deref(),
        Some("Asynchronous payment failed")
    );

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn expired_session_cancels_the_payment() {
    let app = TestApp::spawn().await;

    let (_invoice_id, payment_id) =
        invoice_with_pending_payment(&app, "60.00", Some("cs_exp"), None).await;

    let body = session_event("checkout.session.expired", json!({"id": "cs_exp"}));
    let response = app.post_webhook(&body).await;
    assert_eq!(response.status().as_u16(), 200);

    let payment = app.db.get_payment(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, "canceled");

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn intent_canceled_cancels_the_payment() {
    let app = TestApp::spawn().await;

    let (_invoice_id, payment_id) =
        invoice_with_pending_payment(&app, "60.00", None, Some("pi_c")).await;

    let body = session_event("payment_intent.canceled", json!({"id": "pi_c"}));
    let response = app.post_webhook(&body).await;
    assert_eq!(response.status().as_u16(), 200);

    let payment = app.db.get_payment(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, "canceled");

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn refund_for_unknown_charge_is_acknowledged_untouched() {
    let app = TestApp::spawn().await;

    let (_invoice_id, payment_id) =
        invoice_with_pending_payment(&app, "80.00", Some("cs_bystander"), None).await;

    // No payment carries this charge and the event has no metadata, so the
    // engine drops it before any charge re-fetch could happen.
    let body = session_event(
        "charge.refunded",
        json!({"id": "ch_stranger", "amount": 5000, "amount_refunded": 5000}),
    );
    let response = app.post_webhook(&body).await;
    assert_eq!(response.status().as_u16(), 200);

    let payment = app.db.get_payment(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, "pending");
    assert_eq!(payment.refunded_amount, Decimal::ZERO);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn refunds_track_the_authoritative_charge_total() {
    let mock_stripe = MockServer::start().await;
    let app = TestApp::spawn_with_stripe(&mock_stripe.uri()).await;

    let (invoice_id, payment_id) =
        paid_invoice_with_charge(&app, "100.00", "pi_77", "ch_77").await;

    let charge = |amount_refunded: i64| {
        json!({
            "id": "ch_77",
            "amount": 10000,
            "amount_refunded": amount_refunded,
            "payment_intent": "pi_77",
            "refunded": amount_refunded >= 10000,
        })
    };

    // The charge re-fetch reports 25.00, then 100.00, then a stale 25.00
    Mock::given(method("GET"))
        .and(path("/charges/ch_77"))
        .respond_with(ResponseTemplate::new(200).set_body_json(charge(2500)))
        .up_to_n_times(1)
        .mount(&mock_stripe)
        .await;
    Mock::given(method("GET"))
        .and(path("/charges/ch_77"))
        .respond_with(ResponseTemplate::new(200).set_body_json(charge(10000)))
        .up_to_n_times(1)
        .mount(&mock_stripe)
        .await;
    Mock::given(method("GET"))
        .and(path("/charges/ch_77"))
        .respond_with(ResponseTemplate::new(200).set_body_json(charge(2500)))
        .mount(&mock_stripe)
        .await;

    // Partial refund: payment keeps the remainder, invoice loses paid status
    let body = session_event("charge.refunded", charge(2500));
    let response = app.post_webhook(&body).await;
    assert_eq!(response.status().as_u16(), 200);

    let payment = app.db.get_payment(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, "partially_refunded");
    assert_eq!(payment.refunded_amount, dec("25.00"));
    let invoice = app.db.get_invoice(invoice_id).await.unwrap().unwrap();
    assert_eq!(invoice.status, "unpaid");

    // Full refund reported via the refund object rather than the charge
    let body = session_event(
        "refund.updated",
        json!({"id": "re_1", "charge": "ch_77", "payment_intent": "pi_77"}),
    );
    let response = app.post_webhook(&body).await;
    assert_eq!(response.status().as_u16(), 200);

    let payment = app.db.get_payment(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, "refunded");
    assert_eq!(payment.refunded_amount, dec("100.00"));

    // A redelivered event with a stale snapshot must not roll the total back
    let body = session_event("charge.refunded", charge(2500));
    let response = app.post_webhook(&body).await;
    assert_eq!(response.status().as_u16(), 200);

    let payment = app.db.get_payment(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, "refunded");
    assert_eq!(payment.refunded_amount, dec("100.00"));

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn failed_charge_refetch_asks_provider_to_redeliver() {
    let mock_stripe = MockServer::start().await;
    let app = TestApp::spawn_with_stripe(&mock_stripe.uri()).await;

    let (_invoice_id, payment_id) =
        paid_invoice_with_charge(&app, "100.00", "pi_88", "ch_88").await;

    Mock::given(method("GET"))
        .and(path("/charges/ch_88"))
        .respond_with(
            ResponseTemplate::new(500)
                .set_body_json(json!({"error": {"message": "internal error"}})),
        )
        .mount(&mock_stripe)
        .await;

    let body = session_event(
        "charge.refunded",
        json!({"id": "ch_88", "amount": 10000, "amount_refunded": 10000}),
    );
    let response = app.post_webhook(&body).await;
    assert_eq!(response.status().as_u16(), 502);

    // The payment is untouched until a delivery with a healthy re-fetch lands
    let payment = app.db.get_payment(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, "succeeded");
    assert_eq!(payment.refunded_amount, Decimal::ZERO);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn coverage_spans_multiple_payments() {
    let app = TestApp::spawn().await;

    let invoice = create_test_invoice(
        &app,
        "sent",
        json!([{"description": "Project", "quantity": 1, "unit_price": "100.00"}]),
    )
    .await;
    let invoice_id = Uuid::parse_str(invoice["invoice_id"].as_str().unwrap()).unwrap();

    seed_pending_payment(&app, invoice_id, "40.00", None, Some("pi_a")).await;
    seed_pending_payment(&app, invoice_id, "60.00", None, Some("pi_b")).await;

    let response = app
        .post_webhook(&session_event(
            "payment_intent.succeeded",
            json!({"id": "pi_a"}),
        ))
        .await;
    assert_eq!(response.status().as_u16(), 200);

    // 40 of 100 covered, not paid yet
    let current = app.db.get_invoice(invoice_id).await.unwrap().unwrap();
    assert_eq!(current.status, "sent");

    let response = app
        .post_webhook(&session_event(
            "payment_intent.succeeded",
            json!({"id": "pi_b"}),
        ))
        .await;
    assert_eq!(response.status().as_u16(), 200);

    let current = app.db.get_invoice(invoice_id).await.unwrap().unwrap();
    assert_eq!(current.status, "paid");

    app.cleanup().await;
}
