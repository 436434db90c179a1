//! Error types for the booking domain.
//!
//! Each port has its own error enum. Expected business outcomes (a full slot,
//! a declined card) are modelled as variants so callers can tell them apart
//! from infrastructure trouble, but the saga turns them into a
//! [`FailureReason`](crate::types::FailureReason) instead of propagating them.

use crate::types::{BookingId, BookingStatus, ReservationId, SlotStatus, TimeSlotId};
use thiserror::Error;

/// Errors from a [`CapacityStore`](crate::capacity::CapacityStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapacityError {
    /// Slot does not exist
    #[error("Time slot not found: {0}")]
    SlotNotFound(TimeSlotId),

    /// Slot exists but is closed or under maintenance
    #[error("Time slot {time_slot_id} is not open for booking ({status:?})")]
    SlotUnavailable {
        /// Slot id
        time_slot_id: TimeSlotId,
        /// Its current status
        status: SlotStatus,
    },

    /// Not enough free seats
    #[error("Not enough capacity: requested {requested}, available {available}")]
    CapacityExhausted {
        /// Seats requested
        requested: u32,
        /// Seats free at the time of the attempt
        available: u32,
    },

    /// Player count outside `1..=max_players`
    #[error("Invalid player count: {0}")]
    InvalidPlayerCount(u32),

    /// Reservation id unknown
    #[error("Reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    /// Reservation was released before it could be committed
    #[error("Reservation {0} was already released")]
    ReservationGone(ReservationId),

    /// No reservation was ever committed for this booking
    #[error("No committed reservation for booking {0}")]
    NotCommitted(BookingId),

    /// A slot with this id is already published
    #[error("Time slot already published: {0}")]
    AlreadyPublished(TimeSlotId),

    /// Backing store unreachable or timed out
    #[error("Capacity store unavailable: {0}")]
    Unavailable(String),

    /// The counter broke its bounds; something bypassed the store
    #[error("Capacity invariant violated: {0}")]
    InvariantViolation(String),
}

impl CapacityError {
    /// Outcomes the saga reports to the user instead of retrying.
    #[must_use]
    pub const fn is_business_outcome(&self) -> bool {
        matches!(
            self,
            Self::SlotUnavailable { .. }
                | Self::CapacityExhausted { .. }
                | Self::SlotNotFound(_)
                | Self::InvalidPlayerCount(_)
        )
    }

    /// Errors worth retrying in place.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Errors from a [`BookingRepository`](crate::repository::BookingRepository).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// Booking does not exist
    #[error("Booking not found: {0}")]
    NotFound(BookingId),

    /// Booking id or number already used
    #[error("Booking already exists: {0}")]
    Duplicate(BookingId),

    /// Status compare-and-swap lost: the booking is no longer in an expected status
    #[error("Booking {booking_id} is {current}, transition rejected")]
    Conflict {
        /// Booking id
        booking_id: BookingId,
        /// Status found instead
        current: BookingStatus,
    },

    /// Backing store unreachable or timed out
    #[error("Booking repository unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded
    #[error("Corrupt booking row: {0}")]
    Corrupt(String),
}

impl RepositoryError {
    /// Errors worth retrying in place.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Errors from a [`PaymentGateway`](crate::payment::PaymentGateway).
///
/// A declined charge is not an error; see
/// [`ChargeOutcome`](crate::payment::ChargeOutcome).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Network trouble or a 5xx; safe to retry
    #[error("Payment gateway transient error: {0}")]
    Transient(String),

    /// The gateway refused the request outright
    #[error("Payment gateway rejected request: {0}")]
    Rejected(String),

    /// No answer within the call timeout; the charge may or may not exist
    #[error("Payment gateway call timed out")]
    Timeout,
}

impl GatewayError {
    /// Errors worth retrying in place.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors from the idempotency guard and its store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyError {
    /// Key already used for a different request
    #[error("Idempotency key {key} was already used for a different request")]
    KeyReuse {
        /// The reused key
        key: String,
        /// Booking the key belongs to
        booking_id: BookingId,
    },

    /// Backing store unreachable or timed out
    #[error("Idempotency store unavailable: {0}")]
    Unavailable(String),
}

/// Errors from a [`SlotCatalog`](crate::catalog::SlotCatalog).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// Slot does not exist
    #[error("Time slot not found: {0}")]
    SlotNotFound(TimeSlotId),

    /// Catalog unreachable
    #[error("Slot catalog unavailable: {0}")]
    Unavailable(String),
}

/// Facade-level error returned by [`BookingService`](crate::orchestrator::BookingService).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    /// Bad input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Slot does not exist
    #[error("Time slot not found: {0}")]
    SlotNotFound(TimeSlotId),

    /// Booking does not exist (or does not belong to the caller)
    #[error("Booking not found: {0}")]
    BookingNotFound(String),

    /// Slot has already teed off
    #[error("Time slot {0} has already started")]
    SlotInPast(TimeSlotId),

    /// The refund policy does not allow this cancellation
    #[error("Cancellation not allowed: {0}")]
    CancellationDenied(String),

    /// The booking is not in a status the operation accepts
    #[error("Booking is {status}, operation not allowed")]
    InvalidState {
        /// Current status
        status: BookingStatus,
    },

    /// Idempotency guard failure
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),

    /// Capacity store failure
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    /// Repository failure
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Payment gateway failure
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Catalog failure
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result alias for facade operations.
pub type BookingResult<T> = Result<T, BookingError>;
