//! Recurring schedule integration tests for billing-service.

mod common;

use chrono::{Duration, NaiveDate, Utc};
use common::{TestApp, TEST_CLIENT_ID, TEST_USER_ID};
use reqwest::Client;
use serde_json::json;
use uuid::Uuid;

/// Helper to create a recurring schedule and return its JSON representation.
async fn create_test_schedule(
    app: &TestApp,
    interval: &str,
    next_send_date: NaiveDate,
) -> serde_json::Value {
    let response = Client::new()
        .post(format!("{}/recurring", app.http_address))
        .json(&json!({
            "user_id": TEST_USER_ID,
            "client_id": TEST_CLIENT_ID,
            "client_name": "Acme Corp",
            "client_email": "billing@acme.test",
            "title": "Retainer",
            "amount": "250.00",
            "recurrence_interval": interval,
            "next_send_date": next_send_date.to_string(),
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 201, "schedule creation failed");
    response.json().await.expect("Failed to parse schedule JSON")
}

/// Helper to post a status transition and return the response.
async fn post_transition(app: &TestApp, id: &str, action: &str) -> reqwest::Response {
    Client::new()
        .post(format!("{}/recurring/{}/{}", app.http_address, id, action))
        .send()
        .await
        .expect("Failed to execute request")
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn create_schedule_starts_pending() {
    let app = TestApp::spawn().await;

    let schedule = create_test_schedule(&app, "month", Utc::now().date_naive()).await;
    assert_eq!(schedule["status"], "pending");
    assert_eq!(schedule["recurrence_interval"], "month");
    assert_eq!(schedule["title"], "Retainer");

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn create_schedule_rejects_unknown_interval() {
    let app = TestApp::spawn().await;

    let response = Client::new()
        .post(format!("{}/recurring", app.http_address))
        .json(&json!({
            "user_id": TEST_USER_ID,
            "client_id": TEST_CLIENT_ID,
            "client_name": "Acme Corp",
            "title": "Retainer",
            "amount": "250.00",
            "recurrence_interval": "fortnight",
            "next_send_date": "2026-09-01",
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 400);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn get_unknown_schedule_returns_not_found() {
    let app = TestApp::spawn().await;

    let response = Client::new()
        .get(format!(
            "{}/recurring/99999999-9999-9999-9999-999999999999",
            app.http_address
        ))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 404);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn schedule_can_be_activated_paused_and_resumed() {
    let app = TestApp::spawn().await;

    let schedule = create_test_schedule(&app, "week", Utc::now().date_naive()).await;
    let id = schedule["recurring_invoice_id"]
        .as_str()
        .expect("missing schedule id");

    let response = post_transition(&app, id, "activate").await;
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "active");

    let response = post_transition(&app, id, "pause").await;
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "paused");

    let response = post_transition(&app, id, "activate").await;
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "active");

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn pending_schedule_cannot_be_paused() {
    let app = TestApp::spawn().await;

    let schedule = create_test_schedule(&app, "month", Utc::now().date_naive()).await;
    let id = schedule["recurring_invoice_id"]
        .as_str()
        .expect("missing schedule id");

    let response = post_transition(&app, id, "pause").await;
    assert_eq!(response.status().as_u16(), 400);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn cancelled_schedule_is_terminal() {
    let app = TestApp::spawn().await;

    let schedule = create_test_schedule(&app, "month", Utc::now().date_naive()).await;
    let id = schedule["recurring_invoice_id"]
        .as_str()
        .expect("missing schedule id");

    let response = post_transition(&app, id, "cancel").await;
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "cancelled");

    let response = post_transition(&app, id, "activate").await;
    assert_eq!(response.status().as_u16(), 400);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn sweep_generates_invoice_and_advances_schedule() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let today = Utc::now().date_naive();

    let schedule = create_test_schedule(&app, "day", today).await;
    let id = schedule["recurring_invoice_id"]
        .as_str()
        .expect("missing schedule id");
    let schedule_id = Uuid::parse_str(id).unwrap();

    let response = post_transition(&app, id, "activate").await;
    assert_eq!(response.status().as_u16(), 200);

    let response = client
        .post(format!("{}/recurring/sweep", app.http_address))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 200);
    let outcome: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(outcome["processed"], 1);
    assert_eq!(outcome["errors"].as_array().map(Vec::len), Some(0));

    // A daily schedule due today moves to tomorrow
    let response = client
        .get(format!("{}/recurring/{}", app.http_address, id))
        .send()
        .await
        .expect("Failed to execute request");
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(
        body["next_send_date"],
        (today + Duration::days(1)).to_string()
    );

    // The sweep created one client-visible invoice linked to the schedule
    let (count, status): (i64, Option<String>) = sqlx::query_as(
        "SELECT COUNT(*), MIN(status) FROM invoices WHERE recurring_invoice_id = $1",
    )
    .bind(schedule_id)
    .fetch_one(app.db.pool())
    .await
    .expect("Failed to query generated invoices");
    assert_eq!(count, 1);
    assert_eq!(status.as_deref(), Some("sent"));

    // Nothing is due any more, so a second sweep is a no-op
    let response = client
        .post(format!("{}/recurring/sweep", app.http_address))
        .send()
        .await
        .expect("Failed to execute request");
    let outcome: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(outcome["processed"], 0);

    // Both passes left a completed audit row
    let (runs, status): (i64, Option<String>) =
        sqlx::query_as("SELECT COUNT(*), MIN(status) FROM sweep_runs")
            .fetch_one(app.db.pool())
            .await
            .expect("Failed to query sweep runs");
    assert_eq!(runs, 2);
    assert_eq!(status.as_deref(), Some("completed"));

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn sweep_skips_schedules_that_were_never_activated() {
    let app = TestApp::spawn().await;
    let client = Client::new();

    create_test_schedule(&app, "day", Utc::now().date_naive()).await;

    let response = client
        .post(format!("{}/recurring/sweep", app.http_address))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 200);
    let outcome: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(outcome["processed"], 0);
    assert_eq!(outcome["errors"].as_array().map(Vec::len), Some(0));

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn sweep_skips_schedules_due_in_the_future() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let tomorrow = Utc::now().date_naive() + Duration::days(1);

    let schedule = create_test_schedule(&app, "month", tomorrow).await;
    let id = schedule["recurring_invoice_id"]
        .as_str()
        .expect("missing schedule id");
    post_transition(&app, id, "activate").await;

    let response = client
        .post(format!("{}/recurring/sweep", app.http_address))
        .send()
        .await
        .expect("Failed to execute request");
    let outcome: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(outcome["processed"], 0);

    app.cleanup().await;
}
