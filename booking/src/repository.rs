//! Booking repository: durable bookings, status compare-and-swap, history.
//!
//! Every status change goes through [`BookingRepository::transition`], which
//! only applies when the booking is still in one of the expected statuses.
//! That single rule is what stops the saga and the watchdog from both
//! resolving the same booking: the loser gets [`RepositoryError::Conflict`].

use crate::error::RepositoryError;
use crate::types::{
    Booking, BookingId, BookingNumber, BookingStatus, FailureReason, Money, ReservationId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

/// Boxed future returned by repository operations.
pub type RepositoryFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, RepositoryError>> + Send + 'a>>;

/// What happened to a booking, as recorded in its history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryAction {
    /// Booking row created
    Created,
    /// Capacity reserved, payment about to start
    SlotReserved,
    /// Booking confirmed
    Confirmed,
    /// Saga failed
    SagaFailed,
    /// Saga abandoned and resolved by the watchdog
    SagaTimeout,
    /// Cancelled by the user
    Cancelled,
    /// Force-cancelled by an administrator
    AdminCancelled,
    /// Cancelled by the system (e.g. course closure)
    SystemCancelled,
}

impl HistoryAction {
    /// Database / wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::SlotReserved => "SLOT_RESERVED",
            Self::Confirmed => "CONFIRMED",
            Self::SagaFailed => "SAGA_FAILED",
            Self::SagaTimeout => "SAGA_TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::AdminCancelled => "ADMIN_CANCELLED",
            Self::SystemCancelled => "SYSTEM_CANCELLED",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATED" => Some(Self::Created),
            "SLOT_RESERVED" => Some(Self::SlotReserved),
            "CONFIRMED" => Some(Self::Confirmed),
            "SAGA_FAILED" => Some(Self::SagaFailed),
            "SAGA_TIMEOUT" => Some(Self::SagaTimeout),
            "CANCELLED" => Some(Self::Cancelled),
            "ADMIN_CANCELLED" => Some(Self::AdminCancelled),
            "SYSTEM_CANCELLED" => Some(Self::SystemCancelled),
            _ => None,
        }
    }
}

/// One audit row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Booking id
    pub booking_id: BookingId,
    /// What happened
    pub action: HistoryAction,
    /// Status before, `None` on creation
    pub from: Option<BookingStatus>,
    /// Status after
    pub to: BookingStatus,
    /// When
    pub at: DateTime<Utc>,
    /// Free-form context
    pub details: Option<String>,
}

/// A status change plus the checkpoint fields that travel with it.
///
/// Fields left `None` keep their stored value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookingUpdate {
    /// New status
    pub status: BookingStatus,
    /// History action to record
    pub action: HistoryAction,
    /// When the change happens
    pub at: DateTime<Utc>,
    /// Reservation held for the booking
    pub reservation_id: Option<ReservationId>,
    /// Saga deadline
    pub saga_deadline: Option<DateTime<Utc>>,
    /// Failure reason
    pub failure_reason: Option<FailureReason>,
    /// Refunded amount
    pub refund_amount: Option<Money>,
    /// Cancellation time
    pub cancelled_at: Option<DateTime<Utc>>,
    /// History details
    pub details: Option<String>,
}

impl BookingUpdate {
    /// A bare status change.
    #[must_use]
    pub const fn new(status: BookingStatus, action: HistoryAction, at: DateTime<Utc>) -> Self {
        Self {
            status,
            action,
            at,
            reservation_id: None,
            saga_deadline: None,
            failure_reason: None,
            refund_amount: None,
            cancelled_at: None,
            details: None,
        }
    }

    /// Record the reservation.
    #[must_use]
    pub const fn with_reservation(mut self, reservation_id: ReservationId) -> Self {
        self.reservation_id = Some(reservation_id);
        self
    }

    /// Record the saga deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.saga_deadline = Some(deadline);
        self
    }

    /// Record why the saga failed.
    #[must_use]
    pub fn with_failure(mut self, reason: FailureReason) -> Self {
        self.details = Some(reason.user_message());
        self.failure_reason = Some(reason);
        self
    }

    /// Record a refund.
    #[must_use]
    pub const fn with_refund(mut self, amount: Money) -> Self {
        self.refund_amount = Some(amount);
        self
    }

    /// Record the cancellation time.
    #[must_use]
    pub const fn with_cancelled_at(mut self, at: DateTime<Utc>) -> Self {
        self.cancelled_at = Some(at);
        self
    }

    /// Attach history details.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Apply to a booking in memory.
    pub fn apply_to(&self, booking: &mut Booking) {
        booking.status = self.status;
        booking.updated_at = self.at;
        if let Some(id) = self.reservation_id {
            booking.reservation_id = Some(id);
        }
        if let Some(deadline) = self.saga_deadline {
            booking.saga_deadline = Some(deadline);
        }
        if let Some(reason) = &self.failure_reason {
            booking.failure_reason = Some(reason.clone());
        }
        if let Some(amount) = self.refund_amount {
            booking.refund_amount = Some(amount);
        }
        if let Some(at) = self.cancelled_at {
            booking.cancelled_at = Some(at);
        }
        if self.status.is_terminal() {
            booking.resolution_lease_until = None;
        }
    }

    /// The history row this update produces.
    #[must_use]
    pub fn history_entry(&self, booking_id: BookingId, from: BookingStatus) -> HistoryEntry {
        HistoryEntry {
            booking_id,
            action: self.action,
            from: Some(from),
            to: self.status,
            at: self.at,
            details: self.details.clone(),
        }
    }
}

/// Durable store of bookings.
pub trait BookingRepository: Send + Sync {
    /// Insert a new booking and its `CREATED` history row.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Duplicate`] if the id or booking number exists.
    fn insert(&self, booking: Booking) -> RepositoryFuture<'_, ()>;

    /// Load a booking.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::NotFound`] for an unknown id.
    fn get(&self, booking_id: BookingId) -> RepositoryFuture<'_, Booking>;

    /// Load a booking by its external number.
    ///
    /// # Errors
    ///
    /// Infrastructure errors only.
    fn get_by_number<'a>(&'a self, number: &'a BookingNumber) -> RepositoryFuture<'a, Option<Booking>>;

    /// Apply `update` only if the booking is in one of `expected`.
    ///
    /// Appends the history row in the same atomic step.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Conflict`] with the status found when it is not in
    /// `expected`; [`RepositoryError::NotFound`] for an unknown id.
    fn transition<'a>(
        &'a self,
        booking_id: BookingId,
        expected: &'a [BookingStatus],
        update: BookingUpdate,
    ) -> RepositoryFuture<'a, Booking>;

    /// `SAGA_PENDING` bookings whose deadline passed and that no live lease covers.
    ///
    /// # Errors
    ///
    /// Infrastructure errors only.
    fn find_expired_sagas(&self, now: DateTime<Utc>, limit: u32) -> RepositoryFuture<'_, Vec<Booking>>;

    /// `PENDING` bookings created before `created_before` that no live lease covers.
    ///
    /// # Errors
    ///
    /// Infrastructure errors only.
    fn find_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> RepositoryFuture<'_, Vec<Booking>>;

    /// Take the per-booking resolve lock until `lease_until`.
    ///
    /// Returns `false` if the booking is terminal or another resolver holds a
    /// live lease.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::NotFound`] for an unknown id.
    fn claim_resolution(
        &self,
        booking_id: BookingId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> RepositoryFuture<'_, bool>;

    /// Drop a resolve lock without resolving.
    ///
    /// # Errors
    ///
    /// Infrastructure errors only.
    fn release_claim(&self, booking_id: BookingId) -> RepositoryFuture<'_, ()>;

    /// History rows, oldest first.
    ///
    /// # Errors
    ///
    /// Infrastructure errors only.
    fn history(&self, booking_id: BookingId) -> RepositoryFuture<'_, Vec<HistoryEntry>>;

    /// Cheap round trip for readiness checks.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Unavailable`] when the backing store is down.
    fn ping(&self) -> RepositoryFuture<'_, ()>;
}

pub(crate) fn lease_is_free(booking: &Booking, now: DateTime<Utc>) -> bool {
    booking.resolution_lease_until.is_none_or(|until| until <= now)
}

#[derive(Debug, Default)]
struct Tables {
    bookings: HashMap<BookingId, Booking>,
    numbers: HashMap<BookingNumber, BookingId>,
    history: HashMap<BookingId, Vec<HistoryEntry>>,
}

/// Booking repository held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryBookingRepository {
    tables: Mutex<Tables>,
}

impl InMemoryBookingRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut tables)
    }
}

fn oldest_first(mut bookings: Vec<Booking>, limit: u32) -> Vec<Booking> {
    bookings.sort_by_key(|b| b.created_at);
    bookings.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
    bookings
}

impl BookingRepository for InMemoryBookingRepository {
    fn insert(&self, booking: Booking) -> RepositoryFuture<'_, ()> {
        Box::pin(async move {
            self.with_tables(|t| {
                if t.bookings.contains_key(&booking.id) || t.numbers.contains_key(&booking.booking_number) {
                    return Err(RepositoryError::Duplicate(booking.id));
                }
                t.history.entry(booking.id).or_default().push(HistoryEntry {
                    booking_id: booking.id,
                    action: HistoryAction::Created,
                    from: None,
                    to: booking.status,
                    at: booking.created_at,
                    details: None,
                });
                t.numbers.insert(booking.booking_number.clone(), booking.id);
                t.bookings.insert(booking.id, booking);
                Ok(())
            })
        })
    }

    fn get(&self, booking_id: BookingId) -> RepositoryFuture<'_, Booking> {
        Box::pin(async move {
            self.with_tables(|t| {
                t.bookings
                    .get(&booking_id)
                    .cloned()
                    .ok_or(RepositoryError::NotFound(booking_id))
            })
        })
    }

    fn get_by_number<'a>(&'a self, number: &'a BookingNumber) -> RepositoryFuture<'a, Option<Booking>> {
        Box::pin(async move {
            Ok(self.with_tables(|t| {
                t.numbers
                    .get(number)
                    .and_then(|id| t.bookings.get(id))
                    .cloned()
            }))
        })
    }

    fn transition<'a>(
        &'a self,
        booking_id: BookingId,
        expected: &'a [BookingStatus],
        update: BookingUpdate,
    ) -> RepositoryFuture<'a, Booking> {
        Box::pin(async move {
            self.with_tables(|t| {
                let booking = t
                    .bookings
                    .get_mut(&booking_id)
                    .ok_or(RepositoryError::NotFound(booking_id))?;
                if !expected.contains(&booking.status) {
                    return Err(RepositoryError::Conflict {
                        booking_id,
                        current: booking.status,
                    });
                }
                let from = booking.status;
                update.apply_to(booking);
                let updated = booking.clone();
                t.history
                    .entry(booking_id)
                    .or_default()
                    .push(update.history_entry(booking_id, from));
                Ok(updated)
            })
        })
    }

    fn find_expired_sagas(&self, now: DateTime<Utc>, limit: u32) -> RepositoryFuture<'_, Vec<Booking>> {
        Box::pin(async move {
            let expired = self.with_tables(|t| {
                t.bookings
                    .values()
                    .filter(|b| b.status == BookingStatus::SagaPending)
                    .filter(|b| b.saga_deadline.is_some_and(|deadline| deadline < now))
                    .filter(|b| lease_is_free(b, now))
                    .cloned()
                    .collect()
            });
            Ok(oldest_first(expired, limit))
        })
    }

    fn find_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> RepositoryFuture<'_, Vec<Booking>> {
        Box::pin(async move {
            let stale = self.with_tables(|t| {
                t.bookings
                    .values()
                    .filter(|b| b.status == BookingStatus::Pending && b.created_at < created_before)
                    .filter(|b| lease_is_free(b, now))
                    .cloned()
                    .collect()
            });
            Ok(oldest_first(stale, limit))
        })
    }

    fn claim_resolution(
        &self,
        booking_id: BookingId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> RepositoryFuture<'_, bool> {
        Box::pin(async move {
            self.with_tables(|t| {
                let booking = t
                    .bookings
                    .get_mut(&booking_id)
                    .ok_or(RepositoryError::NotFound(booking_id))?;
                if !booking.status.is_in_flight() || !lease_is_free(booking, now) {
                    return Ok(false);
                }
                booking.resolution_lease_until = Some(lease_until);
                Ok(true)
            })
        })
    }

    fn release_claim(&self, booking_id: BookingId) -> RepositoryFuture<'_, ()> {
        Box::pin(async move {
            self.with_tables(|t| {
                if let Some(booking) = t.bookings.get_mut(&booking_id) {
                    booking.resolution_lease_until = None;
                }
            });
            Ok(())
        })
    }

    fn history(&self, booking_id: BookingId) -> RepositoryFuture<'_, Vec<HistoryEntry>> {
        Box::pin(async move {
            Ok(self.with_tables(|t| t.history.get(&booking_id).cloned().unwrap_or_default()))
        })
    }

    fn ping(&self) -> RepositoryFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{GameId, SlotSnapshot, TimeSlotId, UserId};
    use chrono::Duration;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use teetime_testing::test_instant;

    fn booking(created_at: DateTime<Utc>) -> Booking {
        let slot = SlotSnapshot {
            time_slot_id: TimeSlotId::new(),
            game_id: GameId::new(),
            max_players: 4,
            starts_at: created_at + Duration::days(2),
            ends_at: created_at + Duration::days(2) + Duration::hours(4),
            price_per_player: Money::won(50_000),
        };
        let mut rng = StdRng::seed_from_u64(created_at.timestamp_millis().unsigned_abs());
        Booking::pending(
            BookingId::new(),
            BookingNumber::generate(created_at, &mut rng),
            UserId::new(),
            &slot,
            2,
            created_at,
        )
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let repo = InMemoryBookingRepository::new();
        let b = booking(test_instant());
        repo.insert(b.clone()).await.unwrap();

        assert_eq!(repo.get(b.id).await.unwrap(), b);
        assert_eq!(repo.get_by_number(&b.booking_number).await.unwrap(), Some(b.clone()));
        assert!(matches!(repo.insert(b.clone()).await, Err(RepositoryError::Duplicate(_))));

        let history = repo.history(b.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, HistoryAction::Created);
        assert_eq!(history[0].from, None);
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_swap() {
        let repo = InMemoryBookingRepository::new();
        let b = booking(test_instant());
        repo.insert(b.clone()).await.unwrap();
        let now = test_instant() + Duration::seconds(1);

        let reservation = ReservationId::new();
        let updated = repo
            .transition(
                b.id,
                &[BookingStatus::Pending],
                BookingUpdate::new(BookingStatus::SagaPending, HistoryAction::SlotReserved, now)
                    .with_reservation(reservation)
                    .with_deadline(now + Duration::seconds(60)),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, BookingStatus::SagaPending);
        assert_eq!(updated.reservation_id, Some(reservation));

        let err = repo
            .transition(
                b.id,
                &[BookingStatus::Pending],
                BookingUpdate::new(BookingStatus::SagaFailed, HistoryAction::SagaFailed, now),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RepositoryError::Conflict {
                booking_id: b.id,
                current: BookingStatus::SagaPending
            }
        );

        let history = repo.history(b.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].from, Some(BookingStatus::Pending));
        assert_eq!(history[1].to, BookingStatus::SagaPending);
    }

    #[tokio::test]
    async fn test_expired_saga_scan_respects_lease() {
        let repo = InMemoryBookingRepository::new();
        let start = test_instant();
        let b = booking(start);
        repo.insert(b.clone()).await.unwrap();
        repo.transition(
            b.id,
            &[BookingStatus::Pending],
            BookingUpdate::new(BookingStatus::SagaPending, HistoryAction::SlotReserved, start)
                .with_deadline(start + Duration::seconds(60)),
        )
        .await
        .unwrap();

        assert!(repo.find_expired_sagas(start + Duration::seconds(30), 10).await.unwrap().is_empty());

        let later = start + Duration::seconds(61);
        assert_eq!(repo.find_expired_sagas(later, 10).await.unwrap().len(), 1);

        assert!(repo.claim_resolution(b.id, later, later + Duration::seconds(30)).await.unwrap());
        assert!(!repo.claim_resolution(b.id, later, later + Duration::seconds(30)).await.unwrap());
        assert!(repo.find_expired_sagas(later, 10).await.unwrap().is_empty());

        // An expired lease can be taken over.
        let much_later = later + Duration::seconds(31);
        assert_eq!(repo.find_expired_sagas(much_later, 10).await.unwrap().len(), 1);

        repo.release_claim(b.id).await.unwrap();
        assert!(repo.claim_resolution(b.id, later, later + Duration::seconds(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_transition_clears_lease() {
        let repo = InMemoryBookingRepository::new();
        let start = test_instant();
        let b = booking(start);
        repo.insert(b.clone()).await.unwrap();
        repo.claim_resolution(b.id, start, start + Duration::seconds(30)).await.unwrap();

        let failed = repo
            .transition(
                b.id,
                &[BookingStatus::Pending],
                BookingUpdate::new(BookingStatus::SagaFailed, HistoryAction::SagaTimeout, start)
                    .with_failure(FailureReason::Timeout),
            )
            .await
            .unwrap();
        assert!(failed.resolution_lease_until.is_none());
        assert!(!repo.claim_resolution(b.id, start, start + Duration::seconds(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_pending_scan() {
        let repo = InMemoryBookingRepository::new();
        let start = test_instant();
        let old = booking(start);
        let fresh = booking(start + Duration::seconds(50));
        repo.insert(old.clone()).await.unwrap();
        repo.insert(fresh).await.unwrap();

        let now = start + Duration::seconds(70);
        let stale = repo
            .find_stale_pending(now - Duration::seconds(60), now, 10)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);
    }
}
