//! Capacity store: the only writer of a slot's `booked_players`.
//!
//! Every operation runs as one atomic step per time slot. Reserving reads the
//! counter, checks it against the capacity and records the reservation without
//! releasing the slot in between, so two concurrent reservations can never
//! both take the last seats.
//!
//! All operations are idempotent per booking or reservation:
//!
//! | Operation             | Repeated call                                   |
//! |-----------------------|-------------------------------------------------|
//! | `reserve`             | returns the existing held/committed reservation |
//! | `commit`              | returns the committed reservation               |
//! | `release`             | `AlreadyReleased` / `AlreadyCommitted`          |
//! | `cancel_committed`    | `AlreadyReleased`                               |

mod journal;
mod memory;

pub use journal::JournalEntry;
pub use memory::InMemoryCapacityStore;

use crate::error::CapacityError;
use crate::types::{
    BookingId, CapacityReservation, ReservationId, SlotStatus, TimeSlot, TimeSlotId,
};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by capacity store operations.
pub type CapacityFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CapacityError>> + Send + 'a>>;

/// Request to hold seats on a slot for a booking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReserveRequest {
    /// Slot to reserve on
    pub time_slot_id: TimeSlotId,
    /// Booking the hold is for
    pub booking_id: BookingId,
    /// Seats wanted
    pub player_count: u32,
    /// When the saga asked
    pub requested_at: DateTime<Utc>,
}

/// Result of releasing a reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Seats returned to the slot
    Released {
        /// How many
        player_count: u32,
    },
    /// Already released earlier; nothing changed
    AlreadyReleased,
    /// Reservation is committed; nothing changed
    AlreadyCommitted,
    /// No reservation exists
    NotFound,
}

impl ReleaseOutcome {
    /// Whether the call changed the counter.
    #[must_use]
    pub const fn freed_seats(self) -> u32 {
        match self {
            Self::Released { player_count } => player_count,
            _ => 0,
        }
    }
}

/// Atomic per-slot capacity operations.
pub trait CapacityStore: Send + Sync {
    /// Publish a new slot.
    ///
    /// # Errors
    ///
    /// [`CapacityError::AlreadyPublished`] if the id is taken.
    fn publish(&self, slot: TimeSlot) -> CapacityFuture<'_, TimeSlot>;

    /// Current slot state.
    ///
    /// # Errors
    ///
    /// [`CapacityError::SlotNotFound`] for an unknown slot.
    fn slot(&self, time_slot_id: TimeSlotId) -> CapacityFuture<'_, TimeSlot>;

    /// Close, put under maintenance, or reopen a slot.
    ///
    /// Reopening recomputes AVAILABLE / FULLY_BOOKED from the counter.
    ///
    /// # Errors
    ///
    /// [`CapacityError::SlotNotFound`] for an unknown slot.
    fn set_status(&self, time_slot_id: TimeSlotId, status: SlotStatus) -> CapacityFuture<'_, TimeSlot>;

    /// Hold seats for a booking.
    ///
    /// # Errors
    ///
    /// Business outcomes: [`CapacityError::CapacityExhausted`],
    /// [`CapacityError::SlotUnavailable`], [`CapacityError::SlotNotFound`],
    /// [`CapacityError::InvalidPlayerCount`]. A booking whose reservation was
    /// already released gets [`CapacityError::ReservationGone`].
    fn reserve(&self, request: ReserveRequest) -> CapacityFuture<'_, CapacityReservation>;

    /// Make a held reservation permanent.
    ///
    /// # Errors
    ///
    /// [`CapacityError::ReservationGone`] if it was released,
    /// [`CapacityError::ReservationNotFound`] if it never existed.
    fn commit(&self, reservation_id: ReservationId) -> CapacityFuture<'_, CapacityReservation>;

    /// Return a held reservation's seats.
    ///
    /// # Errors
    ///
    /// Infrastructure errors only.
    fn release(&self, reservation_id: ReservationId) -> CapacityFuture<'_, ReleaseOutcome>;

    /// Return the seats held for a booking, whatever its reservation id.
    ///
    /// Used by compensation when the saga never learned the reservation id.
    ///
    /// # Errors
    ///
    /// Infrastructure errors only.
    fn release_for_booking(&self, booking_id: BookingId) -> CapacityFuture<'_, ReleaseOutcome>;

    /// Return the seats of a committed reservation (booking cancelled).
    ///
    /// # Errors
    ///
    /// [`CapacityError::NotCommitted`] if the booking's reservation is still held.
    fn cancel_committed(&self, booking_id: BookingId) -> CapacityFuture<'_, ReleaseOutcome>;

    /// The reservation recorded for a booking, in any state.
    ///
    /// # Errors
    ///
    /// Infrastructure errors only.
    fn reservation_for_booking(
        &self,
        booking_id: BookingId,
    ) -> CapacityFuture<'_, Option<CapacityReservation>>;

    /// Cheap round trip for readiness checks.
    ///
    /// # Errors
    ///
    /// [`CapacityError::Unavailable`] when the backing store is down.
    fn ping(&self) -> CapacityFuture<'_, ()>;
}

/// Validate a reserve request against a slot. Shared by every backend.
pub(crate) fn check_reservable(slot: &TimeSlot, player_count: u32) -> Result<(), CapacityError> {
    if player_count == 0 || player_count > slot.max_players {
        return Err(CapacityError::InvalidPlayerCount(player_count));
    }
    if !slot.status.is_open() {
        return Err(CapacityError::SlotUnavailable {
            time_slot_id: slot.id,
            status: slot.status,
        });
    }
    let available = slot.available_players();
    if player_count > available {
        return Err(CapacityError::CapacityExhausted {
            requested: player_count,
            available,
        });
    }
    Ok(())
}

/// Raise the alert for a counter that left `0..=max_players`.
pub(crate) fn alert_invariant_violation(time_slot_id: TimeSlotId, detail: &str) {
    crate::metrics::record_alert("invariant_violation");
    tracing::error!(
        alert = true,
        time_slot_id = %time_slot_id,
        detail,
        "Capacity invariant violated"
    );
}
