//! Domain types for tee-time booking.
//!
//! Identifiers, money, time slots, bookings and the reasons a booking can fail.
//! Everything here is plain data; behaviour lives in the stores and the saga.

use crate::error::BookingError;
use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a booking
    BookingId
);
uuid_id!(
    /// Unique identifier for a tee-time slot
    TimeSlotId
);
uuid_id!(
    /// Unique identifier for a game (a round on a course, owner of many slots)
    GameId
);
uuid_id!(
    /// Unique identifier for a user
    UserId
);
uuid_id!(
    /// Unique identifier for a capacity reservation
    ReservationId
);

/// External-facing booking number, `BK-<8 digits>-<4 alphanumerics>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookingNumber(String);

const BOOKING_NUMBER_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

impl BookingNumber {
    /// Generate a booking number from the creation time and a random suffix.
    ///
    /// The digits are the last eight digits of the creation time in
    /// milliseconds since the epoch.
    #[must_use]
    pub fn generate<R: Rng + ?Sized>(created_at: DateTime<Utc>, rng: &mut R) -> Self {
        let millis = created_at.timestamp_millis().rem_euclid(100_000_000);
        let suffix: String = (0..4)
            .map(|_| {
                let idx = rng.gen_range(0..BOOKING_NUMBER_ALPHABET.len());
                char::from(BOOKING_NUMBER_ALPHABET[idx])
            })
            .collect();
        Self(format!("BK-{millis:08}-{suffix}"))
    }

    /// Parse and validate a booking number.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Validation`] if the value is not in `BK-dddddddd-XXXX` form.
    pub fn parse(value: &str) -> Result<Self, BookingError> {
        let mut parts = value.split('-');
        let valid = matches!(
            (parts.next(), parts.next(), parts.next(), parts.next()),
            (Some("BK"), Some(digits), Some(suffix), None)
                if digits.len() == 8
                    && digits.bytes().all(|b| b.is_ascii_digit())
                    && suffix.len() == 4
                    && suffix.bytes().all(|b| BOOKING_NUMBER_ALPHABET.contains(&b))
        );
        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(BookingError::Validation(format!(
                "invalid booking number: {value}"
            )))
        }
    }

    /// Borrow the number as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BookingNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-supplied idempotency key: 1 to 128 printable ASCII characters.
///
/// Keys are scoped per user; the same key from two users names two attempts.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Maximum key length
    pub const MAX_LEN: usize = 128;

    /// Validate and wrap a key.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Validation`] if the key is empty, too long, or
    /// contains characters outside printable ASCII.
    pub fn parse(value: &str) -> Result<Self, BookingError> {
        if value.is_empty() || value.len() > Self::MAX_LEN {
            return Err(BookingError::Validation(format!(
                "idempotency key must be 1..={} characters",
                Self::MAX_LEN
            )));
        }
        if !value.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(BookingError::Validation(
                "idempotency key must be printable ASCII without spaces".to_string(),
            ));
        }
        Ok(Self(value.to_string()))
    }

    /// Borrow the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Money
// ============================================================================

/// Amount of money in KRW (no minor unit).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Zero won
    pub const ZERO: Self = Self(0);

    /// Create an amount in won.
    #[must_use]
    pub const fn won(amount: i64) -> Self {
        Self(amount)
    }

    /// The amount in won.
    #[must_use]
    pub const fn amount(self) -> i64 {
        self.0
    }

    /// Multiply by a count, saturating at the numeric bounds.
    #[must_use]
    pub const fn times(self, count: u32) -> Self {
        Self(self.0.saturating_mul(count as i64))
    }

    /// `floor(self * rate_percent / 100)`.
    #[must_use]
    pub const fn percent(self, rate_percent: u32) -> Self {
        Self(self.0.saturating_mul(rate_percent as i64).div_euclid(100))
    }

    /// Saturating addition.
    #[must_use]
    pub const fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Saturating subtraction.
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Whether the amount is zero.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "₩{}", self.0)
    }
}

// ============================================================================
// Time slots
// ============================================================================

/// Booking status of a time slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    /// Open with seats left
    Available,
    /// Open, every seat taken
    FullyBooked,
    /// Soft-closed by the course
    Closed,
    /// Temporarily out of service
    Maintenance,
}

impl SlotStatus {
    /// Whether the slot accepts new reservations at all.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Available | Self::FullyBooked)
    }

    /// Database / wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::FullyBooked => "FULLY_BOOKED",
            Self::Closed => "CLOSED",
            Self::Maintenance => "MAINTENANCE",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "AVAILABLE" => Some(Self::Available),
            "FULLY_BOOKED" => Some(Self::FullyBooked),
            "CLOSED" => Some(Self::Closed),
            "MAINTENANCE" => Some(Self::Maintenance),
            _ => None,
        }
    }
}

/// A fixed-capacity tee time.
///
/// `booked_players` counts held and committed reservations together and only
/// ever changes through a capacity store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    /// Slot id
    pub id: TimeSlotId,
    /// Game this slot belongs to
    pub game_id: GameId,
    /// Tee-off time
    pub starts_at: DateTime<Utc>,
    /// Expected end of the round
    pub ends_at: DateTime<Utc>,
    /// Capacity, fixed once published
    pub max_players: u32,
    /// Seats currently held or committed
    pub booked_players: u32,
    /// Green fee per player
    pub price_per_player: Money,
    /// Current status
    pub status: SlotStatus,
}

impl TimeSlot {
    /// A freshly published, empty slot.
    #[must_use]
    pub fn new(
        game_id: GameId,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        max_players: u32,
        price_per_player: Money,
    ) -> Self {
        Self {
            id: TimeSlotId::new(),
            game_id,
            starts_at,
            ends_at,
            max_players,
            booked_players: 0,
            price_per_player,
            status: SlotStatus::Available,
        }
    }

    /// Calendar date of the tee time.
    #[must_use]
    pub fn date(&self) -> NaiveDate {
        self.starts_at.date_naive()
    }

    /// Seats still free.
    #[must_use]
    pub const fn available_players(&self) -> u32 {
        self.max_players.saturating_sub(self.booked_players)
    }

    /// Re-derive AVAILABLE / FULLY_BOOKED after a counter change.
    ///
    /// Closed and maintenance slots keep their status.
    pub fn recompute_status(&mut self) {
        if self.status.is_open() {
            self.status = if self.booked_players >= self.max_players {
                SlotStatus::FullyBooked
            } else {
                SlotStatus::Available
            };
        }
    }

    /// Read-only metadata cached by a saga.
    #[must_use]
    pub const fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            time_slot_id: self.id,
            game_id: self.game_id,
            max_players: self.max_players,
            starts_at: self.starts_at,
            ends_at: self.ends_at,
            price_per_player: self.price_per_player,
        }
    }
}

/// Slot metadata fetched once per saga start.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    /// Slot id
    pub time_slot_id: TimeSlotId,
    /// Owning game
    pub game_id: GameId,
    /// Capacity
    pub max_players: u32,
    /// Tee-off time
    pub starts_at: DateTime<Utc>,
    /// End time
    pub ends_at: DateTime<Utc>,
    /// Green fee per player
    pub price_per_player: Money,
}

/// Lifecycle of a capacity reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    /// Seats held while the saga runs
    Held,
    /// Seats permanently counted against the slot
    Committed,
    /// Seats returned to the slot
    Released,
}

impl ReservationState {
    /// Database / wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Held => "HELD",
            Self::Committed => "COMMITTED",
            Self::Released => "RELEASED",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "HELD" => Some(Self::Held),
            "COMMITTED" => Some(Self::Committed),
            "RELEASED" => Some(Self::Released),
            _ => None,
        }
    }
}

/// A hold against a slot's capacity, one per booking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityReservation {
    /// Reservation id
    pub id: ReservationId,
    /// Slot the seats are held on
    pub time_slot_id: TimeSlotId,
    /// Booking the seats are held for
    pub booking_id: BookingId,
    /// Seats held
    pub player_count: u32,
    /// When the hold was taken
    pub reserved_at: DateTime<Utc>,
    /// Current state
    pub state: ReservationState,
}

// ============================================================================
// Bookings
// ============================================================================

/// Booking lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    /// Row created, capacity not yet reserved
    Pending,
    /// Capacity reserved, payment in flight
    SagaPending,
    /// Paid and seats committed
    Confirmed,
    /// Saga ended without a booking
    SagaFailed,
    /// Cancelled after confirmation
    Cancelled,
    /// Round played
    Completed,
    /// User did not show up
    NoShow,
}

impl BookingStatus {
    /// Terminal statuses never change through the saga again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !self.is_in_flight()
    }

    /// Statuses owned by a running (or abandoned) saga.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Pending | Self::SagaPending)
    }

    /// Database / wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::SagaPending => "SAGA_PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::SagaFailed => "SAGA_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
            Self::NoShow => "NO_SHOW",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "SAGA_PENDING" => Some(Self::SagaPending),
            "CONFIRMED" => Some(Self::Confirmed),
            "SAGA_FAILED" => Some(Self::SagaFailed),
            "CANCELLED" => Some(Self::Cancelled),
            "COMPLETED" => Some(Self::Completed),
            "NO_SHOW" => Some(Self::NoShow),
            _ => None,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a booking ended in `SAGA_FAILED`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// Not enough seats left
    CapacityExhausted,
    /// Slot closed or under maintenance
    SlotUnavailable,
    /// The payment provider declined the charge
    PaymentDeclined {
        /// Provider's reason
        reason: String,
    },
    /// The payment could not be processed
    PaymentError,
    /// The capacity store stayed unreachable
    CapacityStoreUnavailable,
    /// The saga did not finish before its deadline
    Timeout,
    /// Anything else
    Internal,
}

impl FailureReason {
    /// Stable code for metrics labels and API clients.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::CapacityExhausted => "CAPACITY_EXHAUSTED",
            Self::SlotUnavailable => "SLOT_UNAVAILABLE",
            Self::PaymentDeclined { .. } => "PAYMENT_DECLINED",
            Self::PaymentError => "PAYMENT_ERROR",
            Self::CapacityStoreUnavailable => "CAPACITY_STORE_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
            Self::Internal => "INTERNAL",
        }
    }

    /// Message safe to show to the person booking.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::CapacityExhausted => "This tee time is fully booked.".to_string(),
            Self::SlotUnavailable => "This tee time is not open for booking.".to_string(),
            Self::PaymentDeclined { reason } => format!("Your payment was declined: {reason}"),
            Self::PaymentError => {
                "We could not process your payment. Any charge will be refunded.".to_string()
            },
            Self::CapacityStoreUnavailable => {
                "Booking is temporarily unavailable. Please try again shortly.".to_string()
            },
            Self::Timeout => {
                "Your booking could not be completed in time. Any charge will be refunded."
                    .to_string()
            },
            Self::Internal => "Something went wrong while booking. Please try again.".to_string(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A booking and its saga checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    /// Booking id
    pub id: BookingId,
    /// External booking number
    pub booking_number: BookingNumber,
    /// Who booked
    pub user_id: UserId,
    /// Which slot
    pub time_slot_id: TimeSlotId,
    /// Seats requested
    pub player_count: u32,
    /// Current status
    pub status: BookingStatus,
    /// Total price
    pub amount: Money,
    /// Tee-off time, cached from the slot at saga start
    pub slot_starts_at: DateTime<Utc>,
    /// Reservation held for this booking, once reserved
    pub reservation_id: Option<ReservationId>,
    /// Deadline of the saga, set at the `SAGA_PENDING` checkpoint
    pub saga_deadline: Option<DateTime<Utc>>,
    /// Why the saga failed
    pub failure_reason: Option<FailureReason>,
    /// Amount refunded, if any
    pub refund_amount: Option<Money>,
    /// When the booking was cancelled
    pub cancelled_at: Option<DateTime<Utc>>,
    /// A watchdog resolving this booking holds it until then
    pub resolution_lease_until: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// A new `PENDING` booking.
    #[must_use]
    pub fn pending(
        id: BookingId,
        booking_number: BookingNumber,
        user_id: UserId,
        slot: &SlotSnapshot,
        player_count: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            booking_number,
            user_id,
            time_slot_id: slot.time_slot_id,
            player_count,
            status: BookingStatus::Pending,
            amount: slot.price_per_player.times(player_count),
            slot_starts_at: slot.starts_at,
            reservation_id: None,
            saga_deadline: None,
            failure_reason: None,
            refund_amount: None,
            cancelled_at: None,
            resolution_lease_until: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_booking_number_format() {
        let created = DateTime::parse_from_rfc3339("2025-03-01T09:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut rng = StdRng::seed_from_u64(7);
        let number = BookingNumber::generate(created, &mut rng);

        let millis = created.timestamp_millis() % 100_000_000;
        assert!(number.as_str().starts_with(&format!("BK-{millis:08}-")));
        assert_eq!(BookingNumber::parse(number.as_str()).unwrap(), number);
    }

    #[test]
    fn test_booking_number_rejects_garbage() {
        assert!(BookingNumber::parse("BK-1234-ABCD").is_err());
        assert!(BookingNumber::parse("BK-12345678-abcd").is_err());
        assert!(BookingNumber::parse("XX-12345678-ABCD").is_err());
        assert!(BookingNumber::parse("BK-12345678-ABCD-1").is_err());
    }

    #[test]
    fn test_idempotency_key_validation() {
        assert!(IdempotencyKey::parse("abc").is_ok());
        assert!(IdempotencyKey::parse("").is_err());
        assert!(IdempotencyKey::parse(&"k".repeat(129)).is_err());
        assert!(IdempotencyKey::parse("has space").is_err());
        assert!(IdempotencyKey::parse("키").is_err());
    }

    #[test]
    fn test_money_percent_floors() {
        assert_eq!(Money::won(33_333).percent(50), Money::won(16_666));
        assert_eq!(Money::won(10_000).percent(0), Money::ZERO);
        assert_eq!(Money::won(50_000).times(3), Money::won(150_000));
    }

    #[test]
    fn test_slot_status_follows_counter() {
        let start = Utc::now();
        let mut slot = TimeSlot::new(GameId::new(), start, start, 4, Money::won(50_000));
        slot.booked_players = 4;
        slot.recompute_status();
        assert_eq!(slot.status, SlotStatus::FullyBooked);
        slot.booked_players = 3;
        slot.recompute_status();
        assert_eq!(slot.status, SlotStatus::Available);

        slot.status = SlotStatus::Closed;
        slot.booked_players = 4;
        slot.recompute_status();
        assert_eq!(slot.status, SlotStatus::Closed);
    }

    #[test]
    fn test_status_classification() {
        assert!(BookingStatus::Pending.is_in_flight());
        assert!(BookingStatus::SagaPending.is_in_flight());
        for status in [
            BookingStatus::Confirmed,
            BookingStatus::SagaFailed,
            BookingStatus::Cancelled,
            BookingStatus::Completed,
            BookingStatus::NoShow,
        ] {
            assert!(status.is_terminal());
            assert_eq!(BookingStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_failure_reason_serializes_with_kind_tag() {
        let reason = FailureReason::PaymentDeclined {
            reason: "insufficient funds".to_string(),
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["kind"], "PAYMENT_DECLINED");
        assert_eq!(json["reason"], "insufficient funds");
        assert!(reason.user_message().contains("insufficient funds"));
    }
}
