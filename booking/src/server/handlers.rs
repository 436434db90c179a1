//! Request handlers.
//!
//! ```text
//! POST /api/bookings                         start (or replay) a booking
//! GET  /api/bookings/:id                     poll a booking
//! GET  /api/bookings/by-number/:number       look up by booking number
//! GET  /api/bookings/:id/history             audit trail
//! POST /api/bookings/:id/cancel              cancel as the owner
//! GET  /api/time-slots/:id/availability      seats left
//! POST /api/admin/bookings/:id/cancel        force-cancel with a refund rate
//! POST /api/admin/time-slots                 publish a slot
//! PUT  /api/admin/time-slots/:id/status      close, maintain or reopen a slot
//! ```

use super::state::AppState;
use crate::orchestrator::{CancellationResult, ReplayKind, StartBookingRequest, StartBookingResponse};
use crate::repository::HistoryEntry;
use crate::types::{
    Booking, BookingId, BookingNumber, BookingStatus, GameId, Money, SlotStatus, TimeSlot, TimeSlotId, UserId,
};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use teetime_web::handlers::ReadinessBody;
use teetime_web::{AppError, CorrelationId, IdempotencyKeyHeader, UserIdHeader};
use uuid::Uuid;

// ============================================================================
// Request / response bodies
// ============================================================================

/// Body of `POST /api/bookings`.
#[derive(Debug, Deserialize)]
pub struct StartBookingBody {
    /// Slot to book
    pub time_slot_id: Uuid,
    /// Seats wanted
    pub player_count: u32,
    /// Retry token; the `Idempotency-Key` header wins when both are sent
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// What the caller should make of a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Booked
    Confirmed,
    /// Still being processed; poll again
    Pending,
    /// Not booked; see `message`
    Failed,
    /// Booked, then cancelled
    Cancelled,
}

impl Outcome {
    const fn of(status: BookingStatus) -> Self {
        match status {
            BookingStatus::Pending | BookingStatus::SagaPending => Self::Pending,
            BookingStatus::Confirmed | BookingStatus::Completed | BookingStatus::NoShow => Self::Confirmed,
            BookingStatus::SagaFailed => Self::Failed,
            BookingStatus::Cancelled => Self::Cancelled,
        }
    }
}

/// Answer to `POST /api/bookings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartBookingView {
    /// Booking id, also for polling
    pub booking_id: BookingId,
    /// Booking number, once the booking row exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_number: Option<BookingNumber>,
    /// Outcome
    pub outcome: Outcome,
    /// Human-readable reason when failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Set when this repeats an earlier request with the same key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay: Option<ReplayKind>,
}

impl From<StartBookingResponse> for StartBookingView {
    fn from(response: StartBookingResponse) -> Self {
        Self {
            booking_id: response.booking_id,
            booking_number: response.booking_number,
            outcome: Outcome::of(response.status),
            message: response.failure_reason.map(|reason| reason.user_message()),
            replay: response.replay,
        }
    }
}

/// A booking as shown to its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingView {
    /// Booking id
    pub booking_id: BookingId,
    /// Booking number
    pub booking_number: BookingNumber,
    /// Outcome
    pub outcome: Outcome,
    /// Human-readable reason when failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Slot
    pub time_slot_id: TimeSlotId,
    /// Tee-off time
    pub starts_at: DateTime<Utc>,
    /// Seats
    pub player_count: u32,
    /// Total price
    pub amount: Money,
    /// Refunded amount, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_amount: Option<Money>,
    /// Cancellation time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl From<Booking> for BookingView {
    fn from(booking: Booking) -> Self {
        Self {
            booking_id: booking.id,
            booking_number: booking.booking_number,
            outcome: Outcome::of(booking.status),
            message: booking.failure_reason.map(|reason| reason.user_message()),
            time_slot_id: booking.time_slot_id,
            starts_at: booking.slot_starts_at,
            player_count: booking.player_count,
            amount: booking.amount,
            refund_amount: booking.refund_amount,
            cancelled_at: booking.cancelled_at,
            created_at: booking.created_at,
        }
    }
}

/// Body of a cancellation request.
#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    /// Free-form reason, kept in the history
    #[serde(default)]
    pub reason: Option<String>,
}

/// Body of an operator cancellation.
#[derive(Debug, Default, Deserialize)]
pub struct AdminCancelBody {
    /// Refund rate; the schedule's admin rate when absent
    #[serde(default)]
    pub refund_rate_percent: Option<u32>,
    /// Free-form reason, kept in the history
    #[serde(default)]
    pub reason: Option<String>,
    /// Cancel as the system (course closure) instead of an operator
    #[serde(default)]
    pub system: bool,
}

/// Answer to a cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationView {
    /// Booking after cancellation
    pub booking: BookingView,
    /// Rate applied
    pub refund_rate_percent: u32,
    /// Amount refunded
    pub refund_amount: Money,
}

impl From<CancellationResult> for CancellationView {
    fn from(result: CancellationResult) -> Self {
        Self {
            booking: result.booking.into(),
            refund_rate_percent: result.refund_rate_percent,
            refund_amount: result.refund_amount,
        }
    }
}

/// Seats left on a slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityView {
    /// Slot id
    pub time_slot_id: TimeSlotId,
    /// Calendar date
    pub date: NaiveDate,
    /// Tee-off time
    pub starts_at: DateTime<Utc>,
    /// Capacity
    pub max_players: u32,
    /// Seats held or sold
    pub booked_players: u32,
    /// Seats left
    pub available_players: u32,
    /// Slot status
    pub status: SlotStatus,
    /// Price per player
    pub price_per_player: Money,
}

impl From<TimeSlot> for AvailabilityView {
    fn from(slot: TimeSlot) -> Self {
        Self {
            time_slot_id: slot.id,
            date: slot.date(),
            starts_at: slot.starts_at,
            max_players: slot.max_players,
            booked_players: slot.booked_players,
            available_players: slot.available_players(),
            status: slot.status,
            price_per_player: slot.price_per_player,
        }
    }
}

/// Body of `POST /api/admin/time-slots`.
#[derive(Debug, Deserialize)]
pub struct PublishSlotBody {
    /// Game the slot belongs to
    pub game_id: Uuid,
    /// Tee-off time
    pub starts_at: DateTime<Utc>,
    /// Expected end
    pub ends_at: DateTime<Utc>,
    /// Capacity
    pub max_players: u32,
    /// Green fee per player
    pub price_per_player: Money,
}

/// Body of `PUT /api/admin/time-slots/:id/status`.
#[derive(Debug, Deserialize)]
pub struct SlotStatusBody {
    /// New status
    pub status: SlotStatus,
}

// ============================================================================
// Handlers
// ============================================================================

/// Start a booking.
///
/// `201` when confirmed, `202` while pending, `200` for a failure or a replay.
#[tracing::instrument(skip_all, fields(user_id = %user_id, correlation_id = %correlation_id))]
pub async fn start_booking(
    State(state): State<AppState>,
    CorrelationId(correlation_id): CorrelationId,
    UserIdHeader(user_id): UserIdHeader,
    IdempotencyKeyHeader(header_key): IdempotencyKeyHeader,
    Json(body): Json<StartBookingBody>,
) -> Result<(StatusCode, Json<StartBookingView>), AppError> {
    let idempotency_key = header_key
        .or(body.idempotency_key)
        .ok_or_else(|| AppError::bad_request("Idempotency-Key header or idempotency_key field is required"))?;

    let response = state
        .service
        .start_booking(StartBookingRequest {
            user_id: UserId::from_uuid(user_id),
            time_slot_id: TimeSlotId::from_uuid(body.time_slot_id),
            player_count: body.player_count,
            idempotency_key,
        })
        .await?;

    let code = match (response.replay, response.status) {
        (Some(_), _) => StatusCode::OK,
        (None, BookingStatus::Confirmed) => StatusCode::CREATED,
        (None, BookingStatus::Pending | BookingStatus::SagaPending) => StatusCode::ACCEPTED,
        (None, _) => StatusCode::OK,
    };
    Ok((code, Json(response.into())))
}

/// Poll a booking.
pub async fn get_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<BookingView>, AppError> {
    let booking = state.service.get_booking(BookingId::from_uuid(booking_id)).await?;
    Ok(Json(booking.into()))
}

/// Look up a booking by its number.
pub async fn get_booking_by_number(
    State(state): State<AppState>,
    Path(number): Path<String>,
) -> Result<Json<BookingView>, AppError> {
    let booking = state.service.get_booking_by_number(&number).await?;
    Ok(Json(booking.into()))
}

/// Audit trail of a booking.
pub async fn booking_history(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<Vec<HistoryEntry>>, AppError> {
    let history = state.service.history(BookingId::from_uuid(booking_id)).await?;
    Ok(Json(history))
}

/// Cancel a booking as its owner.
#[tracing::instrument(skip_all, fields(user_id = %user_id, correlation_id = %correlation_id))]
pub async fn cancel_booking(
    State(state): State<AppState>,
    CorrelationId(correlation_id): CorrelationId,
    UserIdHeader(user_id): UserIdHeader,
    Path(booking_id): Path<Uuid>,
    body: Option<Json<CancelBody>>,
) -> Result<Json<CancellationView>, AppError> {
    let Json(body) = body.unwrap_or_default();
    let result = state
        .service
        .cancel_booking(BookingId::from_uuid(booking_id), UserId::from_uuid(user_id), body.reason)
        .await?;
    Ok(Json(result.into()))
}

/// Force-cancel a booking.
#[tracing::instrument(skip_all, fields(booking_id = %booking_id))]
pub async fn admin_cancel(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    body: Option<Json<AdminCancelBody>>,
) -> Result<Json<CancellationView>, AppError> {
    let Json(body) = body.unwrap_or_default();
    let booking_id = BookingId::from_uuid(booking_id);
    let result = if body.system {
        let reason = body.reason.unwrap_or_else(|| "Cancelled by the course".to_string());
        state.service.system_cancel(booking_id, reason).await?
    } else {
        state
            .service
            .admin_cancel(booking_id, body.refund_rate_percent, body.reason)
            .await?
    };
    Ok(Json(result.into()))
}

/// Seats left on a slot.
pub async fn availability(
    State(state): State<AppState>,
    Path(time_slot_id): Path<Uuid>,
) -> Result<Json<AvailabilityView>, AppError> {
    let slot = state.service.availability(TimeSlotId::from_uuid(time_slot_id)).await?;
    Ok(Json(slot.into()))
}

/// Publish a slot.
pub async fn publish_slot(
    State(state): State<AppState>,
    Json(body): Json<PublishSlotBody>,
) -> Result<(StatusCode, Json<AvailabilityView>), AppError> {
    if body.max_players == 0 {
        return Err(AppError::validation("max_players must be at least 1"));
    }
    if body.ends_at <= body.starts_at {
        return Err(AppError::validation("ends_at must be after starts_at"));
    }
    let slot = TimeSlot::new(
        GameId::from_uuid(body.game_id),
        body.starts_at,
        body.ends_at,
        body.max_players,
        body.price_per_player,
    );
    let slot = state.service.publish_slot(slot).await?;
    Ok((StatusCode::CREATED, Json(slot.into())))
}

/// Change a slot's status.
pub async fn set_slot_status(
    State(state): State<AppState>,
    Path(time_slot_id): Path<Uuid>,
    Json(body): Json<SlotStatusBody>,
) -> Result<Json<AvailabilityView>, AppError> {
    let slot = state
        .service
        .set_slot_status(TimeSlotId::from_uuid(time_slot_id), body.status)
        .await?;
    Ok(Json(slot.into()))
}

/// Readiness probe.
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<ReadinessBody>) {
    let report = state.service.health().await;
    teetime_web::handlers::readiness(&report)
}
