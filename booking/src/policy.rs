//! Cancellation and refund policy evaluation.
//!
//! [`evaluate`] is a pure function of `(booking, policy, now)`. The policy
//! itself is configuration owned by administrators and only read here.

use crate::config::PolicyConfig;
use crate::types::{Booking, BookingStatus, Money};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One band of the tiered refund schedule.
///
/// A tier matches when `min_hours_before <= hours < max_hours_before`; an open
/// upper bound matches everything above `min_hours_before`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundTier {
    /// Inclusive lower bound, hours before tee-off
    pub min_hours_before: u32,
    /// Exclusive upper bound, hours before tee-off
    pub max_hours_before: Option<u32>,
    /// Refund rate in percent
    pub refund_rate_percent: u32,
    /// Display label
    pub label: String,
}

impl RefundTier {
    /// Build a tier.
    #[must_use]
    pub fn new(
        min_hours_before: u32,
        max_hours_before: Option<u32>,
        refund_rate_percent: u32,
        label: impl Into<String>,
    ) -> Self {
        Self {
            min_hours_before,
            max_hours_before,
            refund_rate_percent: refund_rate_percent.min(100),
            label: label.into(),
        }
    }

    fn matches(&self, hours_before: f64) -> bool {
        hours_before >= f64::from(self.min_hours_before)
            && self
                .max_hours_before
                .is_none_or(|max| hours_before < f64::from(max))
    }
}

/// Refund schedule and fees.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundSchedule {
    /// Tiers, checked in order; the first match wins
    pub tiers: Vec<RefundTier>,
    /// Flat fee deducted from every refund
    pub refund_fee: Money,
    /// Fee in percent of the paid amount
    pub refund_fee_rate_percent: u32,
    /// Floor for a non-zero refund
    pub min_refund_amount: Money,
    /// Default rate when an administrator cancels
    pub admin_cancel_refund_rate: u32,
    /// Rate when the system cancels (course closure, weather)
    pub system_cancel_refund_rate: u32,
}

impl Default for RefundSchedule {
    fn default() -> Self {
        Self {
            tiers: vec![
                RefundTier::new(72, None, 100, "3 days or more"),
                RefundTier::new(24, Some(72), 50, "1 to 3 days"),
                RefundTier::new(0, Some(24), 0, "same day"),
            ],
            refund_fee: Money::ZERO,
            refund_fee_rate_percent: 0,
            min_refund_amount: Money::ZERO,
            admin_cancel_refund_rate: 100,
            system_cancel_refund_rate: 100,
        }
    }
}

/// Who may cancel, until when, and what they get back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationPolicy {
    /// Whether users may cancel at all
    pub allow_user_cancel: bool,
    /// Full refund when cancelling at least this many hours ahead
    pub user_cancel_deadline_hours: u32,
    /// Whether users may cancel inside the deadline (tiered refund)
    pub allow_same_day_cancel: bool,
    /// Tiered rates and fees
    pub schedule: RefundSchedule,
}

impl Default for CancellationPolicy {
    fn default() -> Self {
        Self {
            allow_user_cancel: true,
            user_cancel_deadline_hours: 72,
            allow_same_day_cancel: false,
            schedule: RefundSchedule::default(),
        }
    }
}

impl From<&PolicyConfig> for CancellationPolicy {
    fn from(config: &PolicyConfig) -> Self {
        Self {
            allow_user_cancel: config.allow_user_cancel,
            user_cancel_deadline_hours: config.user_cancel_deadline_hours,
            allow_same_day_cancel: config.allow_same_day_cancel,
            schedule: config.refund_schedule.clone(),
        }
    }
}

/// Why a user cancellation was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancellationDenial {
    /// Only confirmed bookings can be cancelled
    NotConfirmed,
    /// User cancellation is switched off
    UserCancelDisabled,
    /// Inside the deadline and same-day cancellation is off
    PastDeadline,
    /// The round has already started
    SlotStarted,
}

impl CancellationDenial {
    /// Message for the person cancelling.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotConfirmed => "Only confirmed bookings can be cancelled.",
            Self::UserCancelDisabled => "Online cancellation is not available. Please contact the course.",
            Self::PastDeadline => "The cancellation deadline for this tee time has passed.",
            Self::SlotStarted => "This tee time has already started.",
        }
    }
}

/// Result of [`evaluate`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundDecision {
    /// Whether the user may cancel
    pub allowed: bool,
    /// Refund rate in percent, `0..=100`
    pub refund_rate_percent: u32,
    /// Label of the tier that applied
    pub label: Option<String>,
    /// Why the cancellation was refused
    pub denial: Option<CancellationDenial>,
}

impl RefundDecision {
    fn allow(refund_rate_percent: u32, label: Option<String>) -> Self {
        Self {
            allowed: true,
            refund_rate_percent: refund_rate_percent.min(100),
            label,
            denial: None,
        }
    }

    fn deny(denial: CancellationDenial) -> Self {
        Self {
            allowed: false,
            refund_rate_percent: 0,
            label: None,
            denial: Some(denial),
        }
    }

    /// Explicit rate chosen by an administrator or the system.
    #[must_use]
    pub fn forced(refund_rate_percent: u32) -> Self {
        Self::allow(refund_rate_percent, None)
    }

    /// Refund rate as a fraction in `0.0..=1.0`.
    #[must_use]
    pub fn refund_rate(&self) -> f64 {
        f64::from(self.refund_rate_percent) / 100.0
    }

    /// Amount to refund out of `paid`.
    ///
    /// `max(floor(paid * rate) - fee, min_refund)`, never above `paid` and
    /// zero when the rate is zero.
    #[must_use]
    pub fn refund_amount(&self, paid: Money, schedule: &RefundSchedule) -> Money {
        if !self.allowed || self.refund_rate_percent == 0 {
            return Money::ZERO;
        }
        let fee = schedule
            .refund_fee
            .saturating_add(paid.percent(schedule.refund_fee_rate_percent));
        let gross = paid.percent(self.refund_rate_percent).saturating_sub(fee);
        gross.max(schedule.min_refund_amount).min(paid).max(Money::ZERO)
    }
}

/// Decide whether a user may cancel `booking` at `now`, and at what rate.
#[must_use]
pub fn evaluate(booking: &Booking, policy: &CancellationPolicy, now: DateTime<Utc>) -> RefundDecision {
    if booking.status != BookingStatus::Confirmed {
        return RefundDecision::deny(CancellationDenial::NotConfirmed);
    }
    if !policy.allow_user_cancel {
        return RefundDecision::deny(CancellationDenial::UserCancelDisabled);
    }
    if now >= booking.slot_starts_at {
        return RefundDecision::deny(CancellationDenial::SlotStarted);
    }

    #[allow(clippy::cast_precision_loss)] // millisecond spans are far below 2^52
    let hours_before = (booking.slot_starts_at - now).num_milliseconds() as f64 / 3_600_000.0;

    if hours_before > f64::from(policy.user_cancel_deadline_hours) {
        return RefundDecision::allow(100, None);
    }
    if !policy.allow_same_day_cancel {
        return RefundDecision::deny(CancellationDenial::PastDeadline);
    }

    policy
        .schedule
        .tiers
        .iter()
        .find(|tier| tier.matches(hours_before))
        .map_or_else(
            || RefundDecision::allow(0, None),
            |tier| RefundDecision::allow(tier.refund_rate_percent, Some(tier.label.clone())),
        )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{BookingId, BookingNumber, GameId, SlotSnapshot, TimeSlotId, UserId};
    use chrono::Duration;
    use teetime_testing::test_instant;

    fn confirmed_booking(starts_in: Duration) -> Booking {
        let now = test_instant();
        let snapshot = SlotSnapshot {
            time_slot_id: TimeSlotId::new(),
            game_id: GameId::new(),
            max_players: 4,
            starts_at: now + starts_in,
            ends_at: now + starts_in + Duration::hours(2),
            price_per_player: Money::won(50_000),
        };
        let mut booking = Booking::pending(
            BookingId::new(),
            BookingNumber::parse("BK-12345678-AB12").unwrap(),
            UserId::new(),
            &snapshot,
            2,
            now,
        );
        booking.status = BookingStatus::Confirmed;
        booking
    }

    fn same_day_policy() -> CancellationPolicy {
        CancellationPolicy {
            allow_same_day_cancel: true,
            ..CancellationPolicy::default()
        }
    }

    #[test]
    fn test_full_refund_before_deadline() {
        let booking = confirmed_booking(Duration::hours(100));
        let decision = evaluate(&booking, &CancellationPolicy::default(), test_instant());
        assert!(decision.allowed);
        assert_eq!(decision.refund_rate_percent, 100);
        assert!((decision.refund_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_denied_inside_deadline_without_same_day() {
        let booking = confirmed_booking(Duration::hours(48));
        let decision = evaluate(&booking, &CancellationPolicy::default(), test_instant());
        assert!(!decision.allowed);
        assert_eq!(decision.denial, Some(CancellationDenial::PastDeadline));
        assert_eq!(decision.refund_amount(booking.amount, &RefundSchedule::default()), Money::ZERO);
    }

    #[test]
    fn test_exactly_at_deadline_uses_tiers() {
        let booking = confirmed_booking(Duration::hours(72));
        let decision = evaluate(&booking, &same_day_policy(), test_instant());
        assert!(decision.allowed);
        assert_eq!(decision.refund_rate_percent, 100);
        assert_eq!(decision.label.as_deref(), Some("3 days or more"));
    }

    #[test]
    fn test_tiers_step_down_toward_tee_off() {
        let policy = same_day_policy();
        let partial = evaluate(&confirmed_booking(Duration::hours(30)), &policy, test_instant());
        assert_eq!(partial.refund_rate_percent, 50);

        let none = evaluate(&confirmed_booking(Duration::minutes(90)), &policy, test_instant());
        assert!(none.allowed);
        assert_eq!(none.refund_rate_percent, 0);
    }

    #[test]
    fn test_denied_after_start_and_for_unconfirmed() {
        let policy = same_day_policy();
        let started = confirmed_booking(Duration::zero());
        assert_eq!(
            evaluate(&started, &policy, test_instant()).denial,
            Some(CancellationDenial::SlotStarted)
        );

        let mut pending = confirmed_booking(Duration::hours(100));
        pending.status = BookingStatus::SagaPending;
        assert_eq!(
            evaluate(&pending, &policy, test_instant()).denial,
            Some(CancellationDenial::NotConfirmed)
        );

        let disabled = CancellationPolicy {
            allow_user_cancel: false,
            ..policy
        };
        assert_eq!(
            evaluate(&confirmed_booking(Duration::hours(100)), &disabled, test_instant()).denial,
            Some(CancellationDenial::UserCancelDisabled)
        );
    }

    #[test]
    fn test_refund_amount_fees_and_floor() {
        let schedule = RefundSchedule {
            refund_fee: Money::won(1_000),
            refund_fee_rate_percent: 10,
            min_refund_amount: Money::won(5_000),
            ..RefundSchedule::default()
        };
        let paid = Money::won(100_000);

        // 100_000 - (1_000 + 10_000)
        assert_eq!(RefundDecision::forced(100).refund_amount(paid, &schedule), Money::won(89_000));
        // 10_000 - 11_000 is below the floor
        assert_eq!(RefundDecision::forced(10).refund_amount(paid, &schedule), Money::won(5_000));
        assert_eq!(RefundDecision::forced(0).refund_amount(paid, &schedule), Money::ZERO);
        // floor never exceeds what was paid
        assert_eq!(
            RefundDecision::forced(10).refund_amount(Money::won(3_000), &schedule),
            Money::won(3_000)
        );
    }
}
