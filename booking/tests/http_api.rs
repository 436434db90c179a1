//! The HTTP facade end to end, on in-memory stores.

#![allow(clippy::unwrap_used)]

mod common;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use common::{config, Harness, PRICE_PER_PLAYER};
use serde_json::{json, Value};
use teetime_booking::payment::ChargeScript;
use teetime_booking::server::{build_router, AppState};
use teetime_booking::types::{TimeSlotId, UserId};
use teetime_testing::test_instant;
use uuid::Uuid;

fn user_header(user: UserId) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static("x-user-id"),
        HeaderValue::from_str(&user.to_string()).unwrap(),
    )
}

fn key_header(key: &str) -> (HeaderName, HeaderValue) {
    (HeaderName::from_static("idempotency-key"), HeaderValue::from_str(key).unwrap())
}

fn server(harness: &Harness) -> TestServer {
    TestServer::new(build_router(AppState::new(harness.service.clone()))).unwrap()
}

async fn publish(server: &TestServer, max_players: u32) -> TimeSlotId {
    let starts_at = test_instant() + chrono::Duration::days(5);
    let response = server
        .post("/api/admin/time-slots")
        .json(&json!({
            "game_id": Uuid::new_v4(),
            "starts_at": starts_at,
            "ends_at": starts_at + chrono::Duration::hours(2),
            "max_players": max_players,
            "price_per_player": PRICE_PER_PLAYER,
        }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let body: Value = response.json();
    assert_eq!(body["available_players"], max_players);
    serde_json::from_value(body["time_slot_id"].clone()).unwrap()
}

async fn book(server: &TestServer, user: UserId, slot: TimeSlotId, players: u32, key: &str) -> axum_test::TestResponse {
    let (user_name, user_value) = user_header(user);
    let (key_name, key_value) = key_header(key);
    server
        .post("/api/bookings")
        .add_header(user_name, user_value)
        .add_header(key_name, key_value)
        .json(&json!({ "time_slot_id": slot, "player_count": players }))
        .await
}

#[tokio::test]
async fn test_booking_lifecycle_over_http() {
    let harness = Harness::new();
    let server = server(&harness);
    let slot = publish(&server, 4).await;
    let user = UserId::new();

    let created = book(&server, user, slot, 2, "http-1").await;
    created.assert_status(StatusCode::CREATED);
    let body: Value = created.json();
    assert_eq!(body["outcome"], "confirmed");
    let booking_id = body["booking_id"].as_str().unwrap().to_string();
    let number = body["booking_number"].as_str().unwrap().to_string();

    let replay = book(&server, user, slot, 2, "http-1").await;
    replay.assert_status(StatusCode::OK);
    let replay_body: Value = replay.json();
    assert_eq!(replay_body["booking_id"], booking_id.as_str());
    assert_eq!(replay_body["replay"], "terminal");

    let fetched: Value = server.get(&format!("/api/bookings/{booking_id}")).await.json();
    assert_eq!(fetched["outcome"], "confirmed");
    assert_eq!(fetched["amount"], PRICE_PER_PLAYER * 2);

    let by_number: Value = server.get(&format!("/api/bookings/by-number/{number}")).await.json();
    assert_eq!(by_number["booking_id"], booking_id.as_str());

    let availability: Value = server.get(&format!("/api/time-slots/{slot}/availability")).await.json();
    assert_eq!(availability["booked_players"], 2);
    assert_eq!(availability["available_players"], 2);
    assert_eq!(availability["status"], "AVAILABLE");

    let (user_name, user_value) = user_header(user);
    let cancelled = server
        .post(&format!("/api/bookings/{booking_id}/cancel"))
        .add_header(user_name, user_value)
        .json(&json!({ "reason": "rain" }))
        .await;
    cancelled.assert_status_ok();
    let cancelled: Value = cancelled.json();
    assert_eq!(cancelled["booking"]["outcome"], "cancelled");
    assert_eq!(cancelled["refund_rate_percent"], 100);
    assert_eq!(cancelled["refund_amount"], PRICE_PER_PLAYER * 2);

    let history: Value = server.get(&format!("/api/bookings/{booking_id}/history")).await.json();
    let actions: Vec<&str> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["action"].as_str().unwrap())
        .collect();
    assert_eq!(actions, vec!["CREATED", "SLOT_RESERVED", "CONFIRMED", "CANCELLED"]);

    let availability: Value = server.get(&format!("/api/time-slots/{slot}/availability")).await.json();
    assert_eq!(availability["booked_players"], 0);
}

#[tokio::test]
async fn test_failed_booking_reports_human_reason() {
    let harness = Harness::new();
    harness
        .payments
        .script([ChargeScript::Decline("insufficient funds".to_string())]);
    let server = server(&harness);
    let slot = publish(&server, 4).await;

    let response = book(&server, UserId::new(), slot, 2, "declined").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["outcome"], "failed");
    assert!(!body["message"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_full_slot_fails_with_reason() {
    let harness = Harness::new();
    let server = server(&harness);
    let slot = publish(&server, 2).await;

    book(&server, UserId::new(), slot, 2, "first").await.assert_status(StatusCode::CREATED);
    let second = book(&server, UserId::new(), slot, 1, "second").await;

    second.assert_status_ok();
    let body: Value = second.json();
    assert_eq!(body["outcome"], "failed");
    let availability: Value = server.get(&format!("/api/time-slots/{slot}/availability")).await.json();
    assert_eq!(availability["status"], "FULLY_BOOKED");
}

#[tokio::test]
async fn test_request_errors() {
    let harness = Harness::new();
    let server = server(&harness);
    let slot = publish(&server, 4).await;
    let user = UserId::new();

    // No caller identity.
    let anonymous = server
        .post("/api/bookings")
        .json(&json!({ "time_slot_id": slot, "player_count": 2, "idempotency_key": "k" }))
        .await;
    anonymous.assert_status(StatusCode::BAD_REQUEST);

    // No idempotency key anywhere.
    let (user_name, user_value) = user_header(user);
    let keyless = server
        .post("/api/bookings")
        .add_header(user_name, user_value)
        .json(&json!({ "time_slot_id": slot, "player_count": 2 }))
        .await;
    keyless.assert_status(StatusCode::BAD_REQUEST);

    // Unknown slot.
    let unknown = book(&server, user, TimeSlotId::new(), 2, "unknown-slot").await;
    unknown.assert_status(StatusCode::NOT_FOUND);

    // Same key, different request.
    book(&server, user, slot, 2, "reused").await.assert_status(StatusCode::CREATED);
    let reused = book(&server, user, slot, 3, "reused").await;
    reused.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = reused.json();
    assert_eq!(body["code"], "IDEMPOTENCY_KEY_REUSED");

    // Unknown booking.
    server
        .get(&format!("/api/bookings/{}", Uuid::new_v4()))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_rules_over_http() {
    let harness = Harness::new();
    let server = server(&harness);
    let slot = publish(&server, 4).await;
    let owner = UserId::new();

    let body: Value = book(&server, owner, slot, 2, "to-cancel").await.json();
    let booking_id = body["booking_id"].as_str().unwrap().to_string();

    // Someone else cannot see or cancel it.
    let (stranger_name, stranger_value) = user_header(UserId::new());
    server
        .post(&format!("/api/bookings/{booking_id}/cancel"))
        .add_header(stranger_name, stranger_value)
        .await
        .assert_status(StatusCode::NOT_FOUND);

    // Inside the 72 hour deadline the owner is refused, an operator is not.
    harness.clock.advance(chrono::Duration::days(4));
    let (owner_name, owner_value) = user_header(owner);
    let refused = server
        .post(&format!("/api/bookings/{booking_id}/cancel"))
        .add_header(owner_name, owner_value)
        .await;
    refused.assert_status(StatusCode::CONFLICT);
    let refused: Value = refused.json();
    assert_eq!(refused["code"], "CANCELLATION_DENIED");

    let forced = server
        .post(&format!("/api/admin/bookings/{booking_id}/cancel"))
        .json(&json!({ "refund_rate_percent": 30, "reason": "operator goodwill" }))
        .await;
    forced.assert_status_ok();
    let forced: Value = forced.json();
    assert_eq!(forced["refund_amount"], PRICE_PER_PLAYER * 2 * 30 / 100);

    // Cancelling twice is a state error.
    server
        .post(&format!("/api/admin/bookings/{booking_id}/cancel"))
        .await
        .assert_status(StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_configured_refund_schedule_prices_cancellation() {
    let harness = Harness::with_config(config(&[
        ("POLICY_ALLOW_SAME_DAY_CANCEL", "true"),
        (
            "REFUND_SCHEDULE",
            r#"[
                {"min_hours_before": 24, "max_hours_before": 72, "refund_rate_percent": 70, "label": "1 to 3 days"},
                {"min_hours_before": 0, "max_hours_before": 24, "refund_rate_percent": 10, "label": "same day"}
            ]"#,
        ),
        ("REFUND_FEE", "1000"),
    ]));
    let server = server(&harness);
    let slot = publish(&server, 4).await;
    let owner = UserId::new();

    let body: Value = book(&server, owner, slot, 2, "tiered").await.json();
    let booking_id = body["booking_id"].as_str().unwrap().to_string();

    // 71 hours before tee-off.
    harness.clock.advance(chrono::Duration::hours(49));
    let (owner_name, owner_value) = user_header(owner);
    let cancelled = server
        .post(&format!("/api/bookings/{booking_id}/cancel"))
        .add_header(owner_name, owner_value)
        .await;
    cancelled.assert_status_ok();
    let cancelled: Value = cancelled.json();
    assert_eq!(cancelled["refund_rate_percent"], 70);
    assert_eq!(cancelled["refund_amount"], PRICE_PER_PLAYER * 2 * 70 / 100 - 1_000);
}

#[tokio::test]
async fn test_slot_status_changes() {
    let harness = Harness::new();
    let server = server(&harness);
    let slot = publish(&server, 4).await;

    let closed = server
        .put(&format!("/api/admin/time-slots/{slot}/status"))
        .json(&json!({ "status": "MAINTENANCE" }))
        .await;
    closed.assert_status_ok();
    let closed: Value = closed.json();
    assert_eq!(closed["status"], "MAINTENANCE");

    let body: Value = book(&server, UserId::new(), slot, 1, "maintenance").await.json();
    assert_eq!(body["outcome"], "failed");

    let reopened: Value = server
        .put(&format!("/api/admin/time-slots/{slot}/status"))
        .json(&json!({ "status": "AVAILABLE" }))
        .await
        .json();
    assert_eq!(reopened["status"], "AVAILABLE");
    assert_eq!(reopened["booked_players"], 0);
}

#[tokio::test]
async fn test_health_endpoints() {
    let harness = Harness::new();
    let server = server(&harness);

    server.get("/health").await.assert_status_ok();

    let ready = server.get("/health/ready").await;
    ready.assert_status_ok();
    let body: Value = ready.json();
    assert_eq!(body["status"], "healthy");
    let components: Vec<&str> = body["checks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|check| check["component"].as_str().unwrap())
        .collect();
    assert!(components.contains(&"capacity_store"));
    assert!(components.contains(&"booking_repository"));
}

#[tokio::test]
async fn test_correlation_id_is_echoed() {
    let harness = Harness::new();
    let server = server(&harness);
    let correlation = Uuid::new_v4();

    let response = server
        .get("/health")
        .add_header(
            HeaderName::from_static("x-correlation-id"),
            HeaderValue::from_str(&correlation.to_string()).unwrap(),
        )
        .await;

    assert_eq!(response.header("x-correlation-id"), correlation.to_string().as_str());
}
