//! HTTP facade over the booking service.
//!
//! The facade never exposes retries or saga phases: a booking is `confirmed`,
//! `pending` (poll `GET /api/bookings/:id`) or `failed` with a human reason.

pub mod handlers;
mod state;

pub use state::AppState;

use crate::error::{BookingError, CapacityError, IdempotencyError, RepositoryError};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::Router;
use teetime_web::{correlation_id_layer, AppError};
use tower_http::trace::TraceLayer;

/// Build the complete router.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Bookings
        .route("/bookings", post(handlers::start_booking))
        .route("/bookings/by-number/:number", get(handlers::get_booking_by_number))
        .route("/bookings/:id", get(handlers::get_booking))
        .route("/bookings/:id/history", get(handlers::booking_history))
        .route("/bookings/:id/cancel", post(handlers::cancel_booking))
        // Time slots
        .route("/time-slots/:id/availability", get(handlers::availability))
        // Operator endpoints
        .route("/admin/bookings/:id/cancel", post(handlers::admin_cancel))
        .route("/admin/time-slots", post(handlers::publish_slot))
        .route("/admin/time-slots/:id/status", put(handlers::set_slot_status));

    Router::new()
        .route("/health", get(teetime_web::handlers::health_check))
        .route("/health/ready", get(handlers::readiness))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(correlation_id_layer())
        .with_state(state)
}

impl From<BookingError> for AppError {
    fn from(err: BookingError) -> Self {
        match err {
            BookingError::Validation(message) => Self::bad_request(message),
            BookingError::SlotNotFound(id) => Self::not_found("Time slot", id),
            BookingError::BookingNotFound(id) => Self::not_found("Booking", id),
            BookingError::SlotInPast(_) => Self::business(
                StatusCode::UNPROCESSABLE_ENTITY,
                "SLOT_IN_PAST",
                "This tee time has already started.",
            ),
            BookingError::CancellationDenied(message) => {
                Self::business(StatusCode::CONFLICT, "CANCELLATION_DENIED", message)
            },
            BookingError::InvalidState { status } => Self::business(
                StatusCode::CONFLICT,
                "INVALID_BOOKING_STATE",
                format!("Booking is {status}"),
            ),
            BookingError::Idempotency(IdempotencyError::KeyReuse { key, booking_id }) => Self::business(
                StatusCode::UNPROCESSABLE_ENTITY,
                "IDEMPOTENCY_KEY_REUSED",
                format!("Idempotency key {key} was already used for a different booking request"),
            )
            .with_details(serde_json::json!({ "booking_id": booking_id })),
            BookingError::Capacity(CapacityError::AlreadyPublished(id)) => {
                Self::conflict(format!("Time slot {id} already exists"))
            },
            BookingError::Capacity(CapacityError::Unavailable(_))
            | BookingError::Repository(RepositoryError::Unavailable(_))
            | BookingError::Idempotency(IdempotencyError::Unavailable(_)) => {
                let message = err.to_string();
                Self::unavailable("Booking is temporarily unavailable. Please try again shortly.")
                    .with_source(anyhow::anyhow!(message))
            },
            other => {
                let message = other.to_string();
                Self::internal("An internal error occurred").with_source(anyhow::anyhow!(message))
            },
        }
    }
}

/// Serve `router` on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns the I/O error that stopped the server.
pub async fn serve(
    listener: tokio::net::TcpListener,
    router: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "HTTP server listening");
    axum::serve(listener, router).with_graceful_shutdown(shutdown).await
}
