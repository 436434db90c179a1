//! In-memory capacity store with an optional write-ahead journal.
//!
//! Each slot lives behind its own async mutex, which is the per-slot critical
//! section: unrelated slots never contend. The maps that locate a slot are
//! guarded by short synchronous locks that are never held across an await.

use super::journal::{Journal, JournalEntry};
use super::{
    alert_invariant_violation, check_reservable, CapacityFuture, CapacityStore, ReleaseOutcome,
    ReserveRequest,
};
use crate::error::CapacityError;
use crate::types::{
    BookingId, CapacityReservation, ReservationId, ReservationState, SlotStatus, TimeSlot,
    TimeSlotId,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;

#[derive(Debug)]
struct SlotLedger {
    slot: TimeSlot,
    reservations: HashMap<ReservationId, CapacityReservation>,
    by_booking: HashMap<BookingId, ReservationId>,
}

impl SlotLedger {
    fn new(slot: TimeSlot) -> Self {
        Self {
            slot,
            reservations: HashMap::new(),
            by_booking: HashMap::new(),
        }
    }

    fn for_booking(&self, booking_id: BookingId) -> Option<&CapacityReservation> {
        self.by_booking
            .get(&booking_id)
            .and_then(|id| self.reservations.get(id))
    }

    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::SlotPublished { .. } => {},
            JournalEntry::StatusChanged { status, .. } => {
                self.slot.status = status;
            },
            JournalEntry::Reserved { reservation } => {
                let booked = self.slot.booked_players.saturating_add(reservation.player_count);
                if booked > self.slot.max_players {
                    alert_invariant_violation(self.slot.id, "booked_players above max_players");
                }
                self.slot.booked_players = booked;
                self.by_booking.insert(reservation.booking_id, reservation.id);
                self.reservations.insert(reservation.id, reservation);
            },
            JournalEntry::Committed { reservation_id, .. } => {
                if let Some(reservation) = self.reservations.get_mut(&reservation_id) {
                    reservation.state = ReservationState::Committed;
                }
            },
            JournalEntry::Released { reservation_id, .. } => {
                if let Some(reservation) = self.reservations.get_mut(&reservation_id) {
                    if reservation.state != ReservationState::Released {
                        reservation.state = ReservationState::Released;
                        let count = reservation.player_count;
                        if self.slot.booked_players < count {
                            alert_invariant_violation(self.slot.id, "booked_players would go negative");
                            self.slot.booked_players = 0;
                        } else {
                            self.slot.booked_players -= count;
                        }
                    }
                }
            },
        }
        self.slot.recompute_status();
    }
}

/// Capacity store held in process memory.
///
/// Without a journal the ledger is lost on restart; use
/// [`InMemoryCapacityStore::open`] when held reservations must survive a
/// crash.
#[derive(Debug, Default)]
pub struct InMemoryCapacityStore {
    slots: RwLock<HashMap<TimeSlotId, Arc<Mutex<SlotLedger>>>>,
    reservations: RwLock<HashMap<ReservationId, TimeSlotId>>,
    bookings: RwLock<HashMap<BookingId, TimeSlotId>>,
    journal: Option<Journal>,
}

impl InMemoryCapacityStore {
    /// Create an empty store without a journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a journaled store, replaying any entries already in `path`.
    ///
    /// # Errors
    ///
    /// [`CapacityError::Unavailable`] if the journal cannot be read or has a
    /// corrupt entry before its last line.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CapacityError> {
        let (journal, entries) = Journal::open(path.as_ref()).await?;

        let mut ledgers: HashMap<TimeSlotId, SlotLedger> = HashMap::new();
        for entry in entries {
            let time_slot_id = entry.time_slot_id();
            if let JournalEntry::SlotPublished { slot } = entry {
                ledgers
                    .entry(time_slot_id)
                    .or_insert_with(|| SlotLedger::new(slot));
            } else if let Some(ledger) = ledgers.get_mut(&time_slot_id) {
                ledger.apply(entry);
            } else {
                tracing::warn!(time_slot_id = %time_slot_id, "Journal entry for unknown slot skipped");
            }
        }

        let mut reservations = HashMap::new();
        let mut bookings = HashMap::new();
        for ledger in ledgers.values() {
            for reservation in ledger.reservations.values() {
                reservations.insert(reservation.id, ledger.slot.id);
                bookings.insert(reservation.booking_id, ledger.slot.id);
            }
        }

        tracing::info!(
            slots = ledgers.len(),
            reservations = reservations.len(),
            "Capacity ledger replayed"
        );

        Ok(Self {
            slots: RwLock::new(
                ledgers
                    .into_iter()
                    .map(|(id, ledger)| (id, Arc::new(Mutex::new(ledger))))
                    .collect(),
            ),
            reservations: RwLock::new(reservations),
            bookings: RwLock::new(bookings),
            journal: Some(journal),
        })
    }

    /// Number of published slots.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn ledger(&self, time_slot_id: TimeSlotId) -> Result<Arc<Mutex<SlotLedger>>, CapacityError> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&time_slot_id)
            .cloned()
            .ok_or(CapacityError::SlotNotFound(time_slot_id))
    }

    fn slot_of_reservation(&self, reservation_id: ReservationId) -> Option<TimeSlotId> {
        self.reservations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&reservation_id)
            .copied()
    }

    fn slot_of_booking(&self, booking_id: BookingId) -> Option<TimeSlotId> {
        self.bookings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&booking_id)
            .copied()
    }

    /// Journal the entry, then apply it.
    async fn record(&self, ledger: &mut SlotLedger, entry: JournalEntry) -> Result<(), CapacityError> {
        if let Some(journal) = &self.journal {
            journal.append(&entry).await?;
        }
        if let JournalEntry::Reserved { reservation } = &entry {
            self.reservations
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(reservation.id, reservation.time_slot_id);
            self.bookings
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(reservation.booking_id, reservation.time_slot_id);
        }
        ledger.apply(entry);
        Ok(())
    }

    async fn release_held(
        &self,
        ledger: &mut SlotLedger,
        reservation_id: ReservationId,
    ) -> Result<ReleaseOutcome, CapacityError> {
        let Some(reservation) = ledger.reservations.get(&reservation_id) else {
            return Ok(ReleaseOutcome::NotFound);
        };
        match reservation.state {
            ReservationState::Released => Ok(ReleaseOutcome::AlreadyReleased),
            ReservationState::Committed => Ok(ReleaseOutcome::AlreadyCommitted),
            ReservationState::Held => {
                let player_count = reservation.player_count;
                let time_slot_id = ledger.slot.id;
                self.record(ledger, JournalEntry::Released { time_slot_id, reservation_id })
                    .await?;
                tracing::debug!(
                    time_slot_id = %time_slot_id,
                    reservation_id = %reservation_id,
                    player_count,
                    "Capacity released"
                );
                Ok(ReleaseOutcome::Released { player_count })
            },
        }
    }
}

impl CapacityStore for InMemoryCapacityStore {
    fn publish(&self, slot: TimeSlot) -> CapacityFuture<'_, TimeSlot> {
        Box::pin(async move {
            if self.ledger(slot.id).is_ok() {
                return Err(CapacityError::AlreadyPublished(slot.id));
            }
            let mut slot = slot;
            slot.recompute_status();
            if let Some(journal) = &self.journal {
                journal
                    .append(&JournalEntry::SlotPublished { slot: slot.clone() })
                    .await?;
            }

            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            if slots.contains_key(&slot.id) {
                return Err(CapacityError::AlreadyPublished(slot.id));
            }
            slots.insert(slot.id, Arc::new(Mutex::new(SlotLedger::new(slot.clone()))));
            drop(slots);

            tracing::info!(time_slot_id = %slot.id, max_players = slot.max_players, "Time slot published");
            Ok(slot)
        })
    }

    fn slot(&self, time_slot_id: TimeSlotId) -> CapacityFuture<'_, TimeSlot> {
        Box::pin(async move {
            let ledger = self.ledger(time_slot_id)?;
            let ledger = ledger.lock().await;
            Ok(ledger.slot.clone())
        })
    }

    fn set_status(&self, time_slot_id: TimeSlotId, status: SlotStatus) -> CapacityFuture<'_, TimeSlot> {
        Box::pin(async move {
            let ledger = self.ledger(time_slot_id)?;
            let mut ledger = ledger.lock().await;
            self.record(&mut ledger, JournalEntry::StatusChanged { time_slot_id, status })
                .await?;
            tracing::info!(time_slot_id = %time_slot_id, status = status.as_str(), "Time slot status changed");
            Ok(ledger.slot.clone())
        })
    }

    fn reserve(&self, request: ReserveRequest) -> CapacityFuture<'_, CapacityReservation> {
        Box::pin(async move {
            let ledger = self.ledger(request.time_slot_id)?;
            let mut ledger = ledger.lock().await;

            if let Some(existing) = ledger.for_booking(request.booking_id) {
                return match existing.state {
                    ReservationState::Released => Err(CapacityError::ReservationGone(existing.id)),
                    ReservationState::Held | ReservationState::Committed => Ok(existing.clone()),
                };
            }

            check_reservable(&ledger.slot, request.player_count)?;

            let reservation = CapacityReservation {
                id: ReservationId::new(),
                time_slot_id: request.time_slot_id,
                booking_id: request.booking_id,
                player_count: request.player_count,
                reserved_at: request.requested_at,
                state: ReservationState::Held,
            };
            self.record(&mut ledger, JournalEntry::Reserved { reservation: reservation.clone() })
                .await?;

            tracing::debug!(
                time_slot_id = %request.time_slot_id,
                booking_id = %request.booking_id,
                player_count = request.player_count,
                booked_players = ledger.slot.booked_players,
                "Capacity reserved"
            );
            Ok(reservation)
        })
    }

    fn commit(&self, reservation_id: ReservationId) -> CapacityFuture<'_, CapacityReservation> {
        Box::pin(async move {
            let time_slot_id = self
                .slot_of_reservation(reservation_id)
                .ok_or(CapacityError::ReservationNotFound(reservation_id))?;
            let ledger = self.ledger(time_slot_id)?;
            let mut ledger = ledger.lock().await;

            let reservation = ledger
                .reservations
                .get(&reservation_id)
                .cloned()
                .ok_or(CapacityError::ReservationNotFound(reservation_id))?;

            match reservation.state {
                ReservationState::Committed => Ok(reservation),
                ReservationState::Released => Err(CapacityError::ReservationGone(reservation_id)),
                ReservationState::Held => {
                    self.record(&mut ledger, JournalEntry::Committed { time_slot_id, reservation_id })
                        .await?;
                    Ok(CapacityReservation {
                        state: ReservationState::Committed,
                        ..reservation
                    })
                },
            }
        })
    }

    fn release(&self, reservation_id: ReservationId) -> CapacityFuture<'_, ReleaseOutcome> {
        Box::pin(async move {
            let Some(time_slot_id) = self.slot_of_reservation(reservation_id) else {
                return Ok(ReleaseOutcome::NotFound);
            };
            let ledger = self.ledger(time_slot_id)?;
            let mut ledger = ledger.lock().await;
            self.release_held(&mut ledger, reservation_id).await
        })
    }

    fn release_for_booking(&self, booking_id: BookingId) -> CapacityFuture<'_, ReleaseOutcome> {
        Box::pin(async move {
            let Some(time_slot_id) = self.slot_of_booking(booking_id) else {
                return Ok(ReleaseOutcome::NotFound);
            };
            let ledger = self.ledger(time_slot_id)?;
            let mut ledger = ledger.lock().await;
            let Some(reservation_id) = ledger.for_booking(booking_id).map(|r| r.id) else {
                return Ok(ReleaseOutcome::NotFound);
            };
            self.release_held(&mut ledger, reservation_id).await
        })
    }

    fn cancel_committed(&self, booking_id: BookingId) -> CapacityFuture<'_, ReleaseOutcome> {
        Box::pin(async move {
            let Some(time_slot_id) = self.slot_of_booking(booking_id) else {
                return Ok(ReleaseOutcome::NotFound);
            };
            let ledger = self.ledger(time_slot_id)?;
            let mut ledger = ledger.lock().await;
            let Some(reservation) = ledger.for_booking(booking_id).cloned() else {
                return Ok(ReleaseOutcome::NotFound);
            };

            match reservation.state {
                ReservationState::Held => Err(CapacityError::NotCommitted(booking_id)),
                ReservationState::Released => Ok(ReleaseOutcome::AlreadyReleased),
                ReservationState::Committed => {
                    self.record(
                        &mut ledger,
                        JournalEntry::Released {
                            time_slot_id,
                            reservation_id: reservation.id,
                        },
                    )
                    .await?;
                    Ok(ReleaseOutcome::Released {
                        player_count: reservation.player_count,
                    })
                },
            }
        })
    }

    fn reservation_for_booking(
        &self,
        booking_id: BookingId,
    ) -> CapacityFuture<'_, Option<CapacityReservation>> {
        Box::pin(async move {
            let Some(time_slot_id) = self.slot_of_booking(booking_id) else {
                return Ok(None);
            };
            let ledger = self.ledger(time_slot_id)?;
            let ledger = ledger.lock().await;
            Ok(ledger.for_booking(booking_id).cloned())
        })
    }

    fn ping(&self) -> CapacityFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{GameId, Money};
    use chrono::{Duration, Utc};

    async fn store_with_slot(max_players: u32) -> (InMemoryCapacityStore, TimeSlotId) {
        let store = InMemoryCapacityStore::new();
        let start = Utc::now() + Duration::days(3);
        let slot = TimeSlot::new(GameId::new(), start, start + Duration::hours(4), max_players, Money::won(50_000));
        let id = slot.id;
        store.publish(slot).await.unwrap();
        (store, id)
    }

    fn request(time_slot_id: TimeSlotId, player_count: u32) -> ReserveRequest {
        ReserveRequest {
            time_slot_id,
            booking_id: BookingId::new(),
            player_count,
            requested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_reserve_and_release_round_trip() {
        let (store, slot_id) = store_with_slot(4).await;
        let reservation = store.reserve(request(slot_id, 3)).await.unwrap();
        assert_eq!(store.slot(slot_id).await.unwrap().booked_players, 3);

        let outcome = store.release(reservation.id).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::Released { player_count: 3 });
        assert_eq!(store.slot(slot_id).await.unwrap().booked_players, 0);

        assert_eq!(store.release(reservation.id).await.unwrap(), ReleaseOutcome::AlreadyReleased);
        assert_eq!(store.slot(slot_id).await.unwrap().booked_players, 0);
    }

    #[tokio::test]
    async fn test_reserve_is_idempotent_per_booking() {
        let (store, slot_id) = store_with_slot(4).await;
        let req = request(slot_id, 2);
        let first = store.reserve(req).await.unwrap();
        let second = store.reserve(req).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.slot(slot_id).await.unwrap().booked_players, 2);
    }

    #[tokio::test]
    async fn test_exhausted_and_closed_slots() {
        let (store, slot_id) = store_with_slot(4).await;
        store.reserve(request(slot_id, 3)).await.unwrap();

        let err = store.reserve(request(slot_id, 2)).await.unwrap_err();
        assert_eq!(err, CapacityError::CapacityExhausted { requested: 2, available: 1 });

        store.set_status(slot_id, SlotStatus::Maintenance).await.unwrap();
        let err = store.reserve(request(slot_id, 1)).await.unwrap_err();
        assert!(matches!(err, CapacityError::SlotUnavailable { status: SlotStatus::Maintenance, .. }));

        let reopened = store.set_status(slot_id, SlotStatus::Available).await.unwrap();
        assert_eq!(reopened.status, SlotStatus::Available);
        store.reserve(request(slot_id, 1)).await.unwrap();
        assert_eq!(store.slot(slot_id).await.unwrap().status, SlotStatus::FullyBooked);
    }

    #[tokio::test]
    async fn test_commit_then_release_is_noop() {
        let (store, slot_id) = store_with_slot(4).await;
        let reservation = store.reserve(request(slot_id, 2)).await.unwrap();
        let committed = store.commit(reservation.id).await.unwrap();
        assert_eq!(committed.state, ReservationState::Committed);
        assert_eq!(store.commit(reservation.id).await.unwrap().state, ReservationState::Committed);

        assert_eq!(store.release(reservation.id).await.unwrap(), ReleaseOutcome::AlreadyCommitted);
        assert_eq!(store.slot(slot_id).await.unwrap().booked_players, 2);
    }

    #[tokio::test]
    async fn test_commit_after_release_is_gone() {
        let (store, slot_id) = store_with_slot(4).await;
        let reservation = store.reserve(request(slot_id, 1)).await.unwrap();
        store.release_for_booking(reservation.booking_id).await.unwrap();
        let err = store.commit(reservation.id).await.unwrap_err();
        assert_eq!(err, CapacityError::ReservationGone(reservation.id));
    }

    #[tokio::test]
    async fn test_cancel_committed_returns_seats_once() {
        let (store, slot_id) = store_with_slot(4).await;
        let reservation = store.reserve(request(slot_id, 4)).await.unwrap();
        assert!(matches!(
            store.cancel_committed(reservation.booking_id).await,
            Err(CapacityError::NotCommitted(_))
        ));

        store.commit(reservation.id).await.unwrap();
        let outcome = store.cancel_committed(reservation.booking_id).await.unwrap();
        assert_eq!(outcome.freed_seats(), 4);
        assert_eq!(
            store.cancel_committed(reservation.booking_id).await.unwrap(),
            ReleaseOutcome::AlreadyReleased
        );
        let slot = store.slot(slot_id).await.unwrap();
        assert_eq!(slot.booked_players, 0);
        assert_eq!(slot.status, SlotStatus::Available);
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let store = InMemoryCapacityStore::new();
        assert!(matches!(
            store.reserve(request(TimeSlotId::new(), 1)).await,
            Err(CapacityError::SlotNotFound(_))
        ));
        assert_eq!(store.release(ReservationId::new()).await.unwrap(), ReleaseOutcome::NotFound);
        assert_eq!(store.release_for_booking(BookingId::new()).await.unwrap(), ReleaseOutcome::NotFound);
        assert!(store.reservation_for_booking(BookingId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_player_counts() {
        let (store, slot_id) = store_with_slot(4).await;
        assert_eq!(
            store.reserve(request(slot_id, 0)).await.unwrap_err(),
            CapacityError::InvalidPlayerCount(0)
        );
        assert_eq!(
            store.reserve(request(slot_id, 5)).await.unwrap_err(),
            CapacityError::InvalidPlayerCount(5)
        );
    }

    #[tokio::test]
    async fn test_journal_replay_restores_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capacity.jsonl");
        let start = Utc::now() + Duration::days(1);
        let slot = TimeSlot::new(GameId::new(), start, start, 4, Money::won(40_000));
        let slot_id = slot.id;

        let (held, committed, released) = {
            let store = InMemoryCapacityStore::open(&path).await.unwrap();
            store.publish(slot).await.unwrap();
            let held = store.reserve(request(slot_id, 1)).await.unwrap();
            let committed = store.reserve(request(slot_id, 2)).await.unwrap();
            store.commit(committed.id).await.unwrap();
            let released = store.reserve(request(slot_id, 1)).await.unwrap();
            store.release(released.id).await.unwrap();
            (held, committed, released)
        };

        let store = InMemoryCapacityStore::open(&path).await.unwrap();
        assert_eq!(store.slot_count(), 1);
        assert_eq!(store.slot(slot_id).await.unwrap().booked_players, 3);

        let recovered = store.reservation_for_booking(held.booking_id).await.unwrap().unwrap();
        assert_eq!(recovered.state, ReservationState::Held);
        let recovered = store.reservation_for_booking(committed.booking_id).await.unwrap().unwrap();
        assert_eq!(recovered.state, ReservationState::Committed);
        assert_eq!(store.release(released.id).await.unwrap(), ReleaseOutcome::AlreadyReleased);

        // The watchdog can still release what the crashed process held.
        assert_eq!(
            store.release_for_booking(held.booking_id).await.unwrap(),
            ReleaseOutcome::Released { player_count: 1 }
        );
        assert_eq!(store.slot(slot_id).await.unwrap().booked_players, 2);
    }
}
