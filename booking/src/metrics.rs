//! Business metrics for the booking service.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `teetime_bookings_total{status}` - Bookings reaching a status
//! - `teetime_saga_compensations_total{reason}` - Compensations run, by failure reason
//! - `teetime_capacity_reservations_total{outcome}` - Reserve attempts by outcome
//! - `teetime_watchdog_resolutions_total{outcome}` - Expired sagas resolved by the watchdog
//! - `teetime_idempotent_replays_total{kind}` - Requests answered from an earlier attempt
//! - `teetime_alerts_total{kind}` - Conditions that page a human
//! - `teetime_refunds_won_total` - Money refunded
//!
//! ## Histograms
//! - `teetime_saga_duration_seconds` - Time from saga start to a settled outcome

use metrics::{describe_counter, describe_histogram};

/// Register all business metric descriptions. Call once at startup.
pub fn register_business_metrics() {
    describe_counter!(
        "teetime_bookings_total",
        "Bookings reaching a status (confirmed, saga_failed, saga_pending, cancelled)"
    );
    describe_counter!(
        "teetime_saga_compensations_total",
        "Saga compensations run, by failure reason"
    );
    describe_counter!(
        "teetime_capacity_reservations_total",
        "Capacity reserve attempts by outcome (reserved, exhausted, unavailable, error)"
    );
    describe_counter!(
        "teetime_watchdog_resolutions_total",
        "Expired sagas resolved by the watchdog, by outcome"
    );
    describe_counter!(
        "teetime_idempotent_replays_total",
        "Booking requests answered from an earlier attempt (in_flight, terminal)"
    );
    describe_counter!(
        "teetime_alerts_total",
        "Alert-worthy conditions (compensation_stuck, invariant_violation, refund_failed, watchdog_stuck)"
    );
    describe_counter!("teetime_refunds_won_total", "Total refunded amount in KRW");
    describe_histogram!(
        "teetime_saga_duration_seconds",
        "Time from saga start until it settles"
    );

    tracing::info!("Business metrics registered");
}

/// Record a booking reaching `status`.
pub fn record_booking(status: &'static str) {
    metrics::counter!("teetime_bookings_total", "status" => status).increment(1);
    tracing::debug!(status, "Recorded booking metric");
}

/// Record a capacity reserve attempt.
pub fn record_capacity_reservation(outcome: &'static str) {
    metrics::counter!("teetime_capacity_reservations_total", "outcome" => outcome).increment(1);
    tracing::debug!(outcome, "Recorded capacity_reservation metric");
}

/// Record a compensation.
pub fn record_compensation(reason: &'static str) {
    metrics::counter!("teetime_saga_compensations_total", "reason" => reason).increment(1);
    tracing::debug!(reason, "Recorded compensation metric");
}

/// Record a watchdog resolution.
pub fn record_watchdog_resolution(outcome: &'static str) {
    metrics::counter!("teetime_watchdog_resolutions_total", "outcome" => outcome).increment(1);
    tracing::debug!(outcome, "Recorded watchdog_resolution metric");
}

/// Record a replayed booking request.
pub fn record_idempotent_replay(kind: &'static str) {
    metrics::counter!("teetime_idempotent_replays_total", "kind" => kind).increment(1);
    tracing::debug!(kind, "Recorded idempotent_replay metric");
}

/// Record an alert. The caller logs the alert itself.
pub fn record_alert(kind: &'static str) {
    metrics::counter!("teetime_alerts_total", "kind" => kind).increment(1);
}

/// Record a refund.
pub fn record_refund(amount_won: i64) {
    metrics::counter!("teetime_refunds_won_total").increment(amount_won.max(0).unsigned_abs());
    tracing::debug!(amount_won, "Recorded refund metric");
}

/// Record how long a saga took to settle.
pub fn record_saga_duration(duration_secs: f64) {
    metrics::histogram!("teetime_saga_duration_seconds").record(duration_secs);
    tracing::debug!(duration_secs, "Recorded saga_duration metric");
}
