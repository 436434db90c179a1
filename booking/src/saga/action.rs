//! Saga actions: commands that start a run, and events fed back by effects.

use super::state::SagaContext;
use crate::types::{BookingStatus, FailureReason, Money, ReservationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the watchdog wants an abandoned saga finished.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryOutcome {
    /// The charge went through: commit and confirm
    Confirm,
    /// Release whatever is held, refund if asked, then fail
    Compensate {
        /// Whether money may have been captured
        refund: bool,
        /// Failure recorded on the booking
        reason: FailureReason,
    },
}

/// Actions for the booking saga.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaAction {
    // Commands
    /// Begin a new saga for a `PENDING` booking
    Start {
        /// Booking to process
        context: SagaContext,
    },

    /// Finish a saga someone else abandoned
    Recover {
        /// Booking to finish
        context: SagaContext,
        /// How
        outcome: RecoveryOutcome,
    },

    // Events
    /// Seats are held
    CapacityReserved {
        /// Hold id
        reservation_id: ReservationId,
    },

    /// The slot cannot take the booking
    CapacityRejected {
        /// User-facing reason
        reason: FailureReason,
    },

    /// The capacity store stayed unreachable
    CapacityUnreachable {
        /// Last error
        error: String,
    },

    /// `SAGA_PENDING` checkpoint written; payment may start
    PaymentRequested {
        /// Saga deadline
        deadline: DateTime<Utc>,
    },

    /// A checkpoint write failed for good
    CheckpointFailed {
        /// Last error
        error: String,
    },

    /// Charge captured
    PaymentApproved {
        /// Gateway transaction id
        transaction_id: String,
    },

    /// Charge declined
    PaymentDeclined {
        /// Gateway reason
        reason: String,
    },

    /// Charge failed without a decision; money may have moved
    PaymentErrored {
        /// Last error
        error: String,
    },

    /// Charge timed out; its outcome is unknown
    PaymentOutcomeUnknown,

    /// Reservation is permanent
    CapacityCommitted,

    /// Committing failed
    CommitFailed {
        /// The reservation was released under us
        reservation_gone: bool,
        /// Last error
        error: String,
    },

    /// Booking row is `CONFIRMED`
    BookingConfirmed,

    /// Compensation finished
    CapacityReleased {
        /// Refund issued, if one was due
        refunded: Option<Money>,
    },

    /// Compensation stopped before undoing anything; the watchdog finishes
    CompensationDeferred {
        /// Why ownership could not be established
        error: String,
    },

    /// Booking row is `SAGA_FAILED`
    BookingFailed,

    /// The booking left the in-flight statuses without us
    TransitionConflict {
        /// Status found
        current: BookingStatus,
    },
}
