//! Saga state: where one booking attempt is in its workflow.

use crate::types::{
    Booking, BookingId, BookingNumber, BookingStatus, FailureReason, Money, ReservationId,
    TimeSlotId, UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase of a booking saga.
///
/// `Confirmed`, `Failed`, `AwaitingRecovery` and `Superseded` are where a saga
/// run stops. Only the first two are outcomes; the other two hand the booking
/// to the watchdog or to whichever resolver won the race.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaPhase {
    /// Not started
    #[default]
    Idle,
    /// Reserving capacity
    Initiated,
    /// Capacity held, writing the `SAGA_PENDING` checkpoint
    CapacityReserved,
    /// Waiting for the payment gateway
    PaymentInFlight,
    /// Committing the reservation and confirming the booking
    Confirming,
    /// Releasing capacity, then refunding if `refund` is set
    Compensating {
        /// Whether money may have been captured
        refund: bool,
    },
    /// Writing `SAGA_FAILED`
    Failing,
    /// Booking confirmed
    Confirmed,
    /// Booking failed, nothing held
    Failed,
    /// Outcome unknown; the watchdog resolves it after the deadline
    AwaitingRecovery,
    /// Another resolver moved the booking first
    Superseded,
}

impl SagaPhase {
    /// Whether this run of the saga has stopped.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(
            self,
            Self::Confirmed | Self::Failed | Self::AwaitingRecovery | Self::Superseded
        )
    }
}

/// What the saga knows about its booking. Fixed at start, except for the
/// reservation id learned on the way.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaContext {
    /// Booking id
    pub booking_id: BookingId,
    /// External booking number
    pub booking_number: BookingNumber,
    /// Who books
    pub user_id: UserId,
    /// Which slot
    pub time_slot_id: TimeSlotId,
    /// Seats
    pub player_count: u32,
    /// Price to charge
    pub amount: Money,
    /// Reservation, once known
    pub reservation_id: Option<ReservationId>,
}

impl SagaContext {
    /// Context of an existing booking row.
    #[must_use]
    pub fn from_booking(booking: &Booking) -> Self {
        Self {
            booking_id: booking.id,
            booking_number: booking.booking_number.clone(),
            user_id: booking.user_id,
            time_slot_id: booking.time_slot_id,
            player_count: booking.player_count,
            amount: booking.amount,
            reservation_id: booking.reservation_id,
        }
    }
}

/// State of one saga.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaState {
    /// Current phase
    pub phase: SagaPhase,
    /// Booking being processed; `None` while idle
    pub context: Option<SagaContext>,
    /// Why the saga is failing
    pub failure: Option<FailureReason>,
    /// Deadline written at the `SAGA_PENDING` checkpoint
    pub deadline: Option<DateTime<Utc>>,
    /// Gateway transaction of an approved charge
    pub transaction_id: Option<String>,
    /// Amount refunded during compensation
    pub refunded: Option<Money>,
    /// Status found when another resolver won
    pub superseded_by: Option<BookingStatus>,
    /// When this run started
    pub started_at: Option<DateTime<Utc>>,
    /// Run started by the watchdog, which already holds the resolution lease
    pub recovering: bool,
}

impl SagaState {
    /// Whether this run of the saga has stopped.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        self.phase.is_settled()
    }
}
