//! Sagas left behind are resolved exactly once after their deadline.

#![allow(clippy::unwrap_used)]

mod common;

use chrono::Duration as ChronoDuration;
use common::{config, request, wait_for_capture, GatedGateway, Harness, PRICE_PER_PLAYER};
use std::sync::Arc;
use teetime_booking::capacity::{CapacityStore, ReserveRequest};
use teetime_booking::payment::{ChargeScript, MockPaymentGateway};
use teetime_booking::repository::{BookingRepository, HistoryAction};
use teetime_booking::types::{
    Booking, BookingId, BookingNumber, BookingStatus, FailureReason, Money, ReservationState, TimeSlotId, UserId,
};
use teetime_booking::watchdog::SweepReport;
use teetime_core::environment::Clock;
use tokio::sync::watch;

fn past_deadline() -> ChronoDuration {
    ChronoDuration::seconds(61)
}

/// A one-seat slot whose only charge is captured, then answered with an
/// error once the gate opens.
async fn late_error_booking(key: &str) -> (Harness, Arc<GatedGateway>, TimeSlotId, BookingId) {
    let payments = Arc::new(MockPaymentGateway::new());
    payments.script([ChargeScript::CaptureThenReject("gateway internal error".to_string())]);
    let gateway = Arc::new(GatedGateway::holding_replies(payments.clone()));
    let harness = Harness::with_gateway(
        config(&[("SAGA_RESPONSE_WAIT_MS", "200")]),
        payments.clone(),
        gateway.clone(),
    );
    let slot = harness.publish(1).await;

    let response = harness
        .service
        .start_booking(request(slot, UserId::new(), 1, key))
        .await
        .unwrap();
    assert_eq!(response.status, BookingStatus::SagaPending);
    wait_for_capture(&payments, response.booking_id).await;
    assert_eq!(harness.booked(slot).await, 1);

    (harness, gateway, slot, response.booking_id)
}

#[tokio::test]
async fn test_captured_charge_is_confirmed_after_deadline() {
    let harness = Harness::new();
    harness.payments.script([ChargeScript::CaptureThenTimeout]);
    let slot = harness.publish(4).await;

    let response = harness
        .service
        .start_booking(request(slot, UserId::new(), 2, "lost-answer"))
        .await
        .unwrap();
    assert_eq!(response.status, BookingStatus::SagaPending);

    let watchdog = harness.watchdog();
    let early = watchdog.sweep(harness.clock.now()).await;
    assert_eq!(early.examined, 0);

    harness.clock.advance(past_deadline());
    let report = watchdog.sweep(harness.clock.now()).await;
    assert_eq!(report.examined, 1);
    assert_eq!(report.confirmed, 1);

    let booking = harness.booking(response.booking_id).await;
    assert_eq!(booking.status, BookingStatus::Confirmed);
    let reservation = harness
        .capacity
        .reservation_for_booking(response.booking_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reservation.state, ReservationState::Committed);
    assert_eq!(harness.booked(slot).await, 2);

    // Nothing left to do.
    let again = watchdog.sweep(harness.clock.now()).await;
    assert_eq!(again.examined, 0);
}

#[tokio::test]
async fn test_charge_never_made_fails_with_timeout() {
    let harness = Harness::new();
    harness.payments.script([ChargeScript::Timeout]);
    let slot = harness.publish(4).await;

    let response = harness
        .service
        .start_booking(request(slot, UserId::new(), 2, "no-charge"))
        .await
        .unwrap();
    assert_eq!(response.status, BookingStatus::SagaPending);
    assert_eq!(harness.booked(slot).await, 2);

    harness.clock.advance(past_deadline());
    let report = harness.watchdog().sweep(harness.clock.now()).await;
    assert_eq!(report.failed, 1);

    let booking = harness.booking(response.booking_id).await;
    assert_eq!(booking.status, BookingStatus::SagaFailed);
    assert_eq!(booking.failure_reason, Some(FailureReason::Timeout));
    assert_eq!(harness.booked(slot).await, 0);

    let history = harness.service.history(response.booking_id).await.unwrap();
    assert_eq!(history.last().unwrap().action, HistoryAction::SagaTimeout);
}

#[tokio::test]
async fn test_unknown_charge_waits_for_grace_then_refunds() {
    let harness = Harness::with_config(config(&[("WATCHDOG_GRACE_PERIOD_SECS", "120")]));
    harness.payments.script([ChargeScript::CaptureThenTimeout]);
    harness.payments.set_status_unknown(true);
    let slot = harness.publish(4).await;
    let response = harness
        .service
        .start_booking(request(slot, UserId::new(), 2, "gateway-silent"))
        .await
        .unwrap();
    let watchdog = harness.watchdog();

    harness.clock.advance(past_deadline());
    let inside_grace = watchdog.sweep(harness.clock.now()).await;
    assert_eq!(inside_grace.deferred, 1);
    assert_eq!(
        harness.booking(response.booking_id).await.status,
        BookingStatus::SagaPending
    );

    harness.clock.advance(ChronoDuration::seconds(121));
    let after_grace = watchdog.sweep(harness.clock.now()).await;
    assert_eq!(after_grace.failed, 1);

    let booking = harness.booking(response.booking_id).await;
    assert_eq!(booking.status, BookingStatus::SagaFailed);
    assert_eq!(booking.failure_reason, Some(FailureReason::Timeout));
    let paid = Money::won(PRICE_PER_PLAYER * 2);
    assert_eq!(harness.payments.refunded(response.booking_id), Some(paid));
    assert_eq!(booking.refund_amount, Some(paid));
    assert_eq!(harness.booked(slot).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_watchdogs_never_resolve_twice() {
    let harness = Harness::new();
    harness.payments.script([ChargeScript::CaptureThenTimeout]);
    let slot = harness.publish(4).await;
    let response = harness
        .service
        .start_booking(request(slot, UserId::new(), 2, "contended"))
        .await
        .unwrap();

    harness.clock.advance(past_deadline());
    let now = harness.clock.now();
    let first = harness.watchdog();
    let second = harness.watchdog();
    let (a, b): (SweepReport, SweepReport) = tokio::join!(first.sweep(now), second.sweep(now));

    assert_eq!(a.confirmed + b.confirmed, 1);
    assert_eq!(a.failed + b.failed, 0);

    let history = harness.service.history(response.booking_id).await.unwrap();
    let confirmations = history
        .iter()
        .filter(|entry| entry.action == HistoryAction::Confirmed)
        .count();
    assert_eq!(confirmations, 1);
    assert_eq!(harness.booked(slot).await, 2);
}

#[tokio::test]
async fn test_stale_pending_booking_is_failed_and_released() {
    let harness = Harness::new();
    let slot = harness.publish(4).await;
    let now = harness.clock.now();

    // The process reserved seats and died before the SAGA_PENDING checkpoint.
    let snapshot = harness.capacity.slot(slot).await.unwrap().snapshot();
    let booking = Booking::pending(
        BookingId::new(),
        BookingNumber::generate(now, &mut rand::thread_rng()),
        UserId::new(),
        &snapshot,
        3,
        now,
    );
    harness.repository.insert(booking.clone()).await.unwrap();
    harness
        .capacity
        .reserve(ReserveRequest {
            time_slot_id: slot,
            booking_id: booking.id,
            player_count: 3,
            requested_at: now,
        })
        .await
        .unwrap();
    assert_eq!(harness.booked(slot).await, 3);

    let watchdog = harness.watchdog();
    assert_eq!(watchdog.sweep(harness.clock.now()).await.examined, 0);

    harness.clock.advance(past_deadline());
    let report = watchdog.sweep(harness.clock.now()).await;
    assert_eq!(report.failed, 1);

    let resolved = harness.booking(booking.id).await;
    assert_eq!(resolved.status, BookingStatus::SagaFailed);
    assert_eq!(resolved.failure_reason, Some(FailureReason::Timeout));
    assert_eq!(harness.booked(slot).await, 0);
}

#[tokio::test]
async fn test_sweep_purges_expired_keys() {
    let harness = Harness::new();
    let slot = harness.publish(4).await;
    harness
        .service
        .start_booking(request(slot, UserId::new(), 1, "short-lived"))
        .await
        .unwrap();
    assert_eq!(harness.idempotency.len(), 1);

    harness.clock.advance(ChronoDuration::hours(25));
    let report = harness.watchdog().sweep(harness.clock.now()).await;

    assert_eq!(report.purged_keys, 1);
    assert!(harness.idempotency.is_empty());
}

#[tokio::test]
async fn test_background_loop_resolves_and_stops() {
    let harness = Harness::with_config(config(&[("WATCHDOG_INTERVAL_SECS", "1")]));
    harness.payments.script([ChargeScript::CaptureThenTimeout]);
    let slot = harness.publish(4).await;
    let response = harness
        .service
        .start_booking(request(slot, UserId::new(), 2, "background"))
        .await
        .unwrap();
    harness.clock.advance(past_deadline());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(harness.watchdog().run(shutdown_rx));

    harness
        .wait_for_status(response.booking_id, BookingStatus::Confirmed)
        .await;

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_late_payment_error_leaves_watchdog_confirmation_alone() {
    let (harness, gateway, slot, booking_id) = late_error_booking("watchdog-first").await;

    harness.clock.advance(past_deadline());
    let report = harness.watchdog().sweep(harness.clock.now()).await;
    assert_eq!(report.examined, 1);
    assert_eq!(report.confirmed, 1);
    assert_eq!(harness.booking(booking_id).await.status, BookingStatus::Confirmed);

    // The saga now hears about its charge failing.
    gateway.open();
    harness.wait_for_idle_sagas().await;

    let booking = harness.booking(booking_id).await;
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.refund_amount, None);
    assert_eq!(harness.payments.refunded(booking_id), None);
    assert_eq!(harness.booked(slot).await, 1);
    let reservation = harness
        .capacity
        .reservation_for_booking(booking_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reservation.state, ReservationState::Committed);

    let history = harness.service.history(booking_id).await.unwrap();
    assert_eq!(history.last().unwrap().action, HistoryAction::Confirmed);
}

#[tokio::test]
async fn test_saga_compensating_first_leaves_nothing_to_sweep() {
    let (harness, gateway, slot, booking_id) = late_error_booking("saga-first").await;

    gateway.open();
    let booking = harness
        .wait_for_status(booking_id, BookingStatus::SagaFailed)
        .await;
    harness.wait_for_idle_sagas().await;
    assert_eq!(booking.failure_reason, Some(FailureReason::PaymentError));
    let paid = Money::won(PRICE_PER_PLAYER);
    assert_eq!(harness.payments.refunded(booking_id), Some(paid));
    assert_eq!(harness.booked(slot).await, 0);

    // The charge still reads as approved, but the booking is no longer in flight.
    harness.clock.advance(past_deadline());
    let report = harness.watchdog().sweep(harness.clock.now()).await;
    assert_eq!(report.examined, 0);
    assert_eq!(report.confirmed, 0);

    let booking = harness.booking(booking_id).await;
    assert_eq!(booking.status, BookingStatus::SagaFailed);
    assert_eq!(booking.refund_amount, Some(paid));
    assert_eq!(harness.booked(slot).await, 0);
}
