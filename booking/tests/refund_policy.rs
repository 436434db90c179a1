//! Refund decisions depend on nothing but their inputs.

#![allow(clippy::unwrap_used)]

use chrono::Duration;
use proptest::prelude::*;
use teetime_booking::policy::{evaluate, CancellationDenial, CancellationPolicy, RefundDecision, RefundSchedule};
use teetime_booking::types::{
    Booking, BookingId, BookingNumber, BookingStatus, GameId, Money, SlotSnapshot, TimeSlotId, UserId,
};
use teetime_testing::test_instant;

fn booking(starts_in_minutes: i64, players: u32, status: BookingStatus) -> Booking {
    let now = test_instant();
    let snapshot = SlotSnapshot {
        time_slot_id: TimeSlotId::new(),
        game_id: GameId::new(),
        max_players: 4,
        starts_at: now + Duration::minutes(starts_in_minutes),
        ends_at: now + Duration::minutes(starts_in_minutes + 120),
        price_per_player: Money::won(45_000),
    };
    let number = BookingNumber::parse("BK-12345678-AB12").unwrap();
    let mut booking = Booking::pending(BookingId::new(), number, UserId::new(), &snapshot, players, now);
    booking.status = status;
    booking
}

fn any_status() -> impl Strategy<Value = BookingStatus> {
    prop_oneof![
        Just(BookingStatus::Pending),
        Just(BookingStatus::SagaPending),
        Just(BookingStatus::Confirmed),
        Just(BookingStatus::SagaFailed),
        Just(BookingStatus::Cancelled),
        Just(BookingStatus::Completed),
        Just(BookingStatus::NoShow),
    ]
}

fn any_policy() -> impl Strategy<Value = CancellationPolicy> {
    (any::<bool>(), 0u32..200, any::<bool>(), 0i64..20_000, 0u32..20, 0i64..50_000).prop_map(
        |(allow_user_cancel, deadline, same_day, fee, fee_rate, min_refund)| CancellationPolicy {
            allow_user_cancel,
            user_cancel_deadline_hours: deadline,
            allow_same_day_cancel: same_day,
            schedule: RefundSchedule {
                refund_fee: Money::won(fee),
                refund_fee_rate_percent: fee_rate,
                min_refund_amount: Money::won(min_refund),
                ..RefundSchedule::default()
            },
        },
    )
}

proptest! {
    #[test]
    fn prop_identical_inputs_give_identical_decisions(
        starts_in in -600i64..20_000,
        players in 1u32..=4,
        status in any_status(),
        policy in any_policy(),
        elapsed in 0i64..10_000,
    ) {
        let booking = booking(starts_in, players, status);
        let now = test_instant() + Duration::minutes(elapsed);

        let first = evaluate(&booking, &policy, now);
        let second = evaluate(&booking.clone(), &policy.clone(), now);
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(
            first.refund_amount(booking.amount, &policy.schedule),
            second.refund_amount(booking.amount, &policy.schedule)
        );
    }

    #[test]
    fn prop_refund_never_exceeds_payment(
        starts_in in 1i64..20_000,
        players in 1u32..=4,
        policy in any_policy(),
    ) {
        let booking = booking(starts_in, players, BookingStatus::Confirmed);
        let decision = evaluate(&booking, &policy, test_instant());
        let refund = decision.refund_amount(booking.amount, &policy.schedule);

        prop_assert!(refund <= booking.amount);
        prop_assert!(refund >= Money::ZERO);
        prop_assert!(decision.refund_rate_percent <= 100);
        if !decision.allowed || decision.refund_rate_percent == 0 {
            prop_assert_eq!(refund, Money::ZERO);
        }
    }

    #[test]
    fn prop_only_confirmed_bookings_can_be_cancelled(
        status in any_status(),
        policy in any_policy(),
    ) {
        let booking = booking(10_000, 2, status);
        let decision = evaluate(&booking, &policy, test_instant());
        if status != BookingStatus::Confirmed {
            prop_assert!(!decision.allowed);
            prop_assert_eq!(decision.denial, Some(CancellationDenial::NotConfirmed));
        }
    }
}

#[test]
fn test_default_policy_tiers() {
    let policy = CancellationPolicy {
        allow_same_day_cancel: true,
        ..CancellationPolicy::default()
    };
    let now = test_instant();

    let early = evaluate(&booking(5 * 24 * 60, 2, BookingStatus::Confirmed), &policy, now);
    assert_eq!(early.refund_rate_percent, 100);

    let two_days = evaluate(&booking(48 * 60, 2, BookingStatus::Confirmed), &policy, now);
    assert_eq!(two_days.refund_rate_percent, 50);
    assert_eq!(two_days.label.as_deref(), Some("1 to 3 days"));

    let same_day = evaluate(&booking(3 * 60, 2, BookingStatus::Confirmed), &policy, now);
    assert!(same_day.allowed);
    assert_eq!(same_day.refund_rate_percent, 0);

    let started = evaluate(&booking(-10, 2, BookingStatus::Confirmed), &policy, now);
    assert_eq!(started.denial, Some(CancellationDenial::SlotStarted));
}

#[test]
fn test_fees_and_floor_shape_the_amount() {
    let schedule = RefundSchedule {
        refund_fee: Money::won(5_000),
        refund_fee_rate_percent: 10,
        min_refund_amount: Money::won(20_000),
        ..RefundSchedule::default()
    };
    let paid = Money::won(100_000);

    // 50% of 100_000 minus 5_000 flat and 10_000 rate fee.
    assert_eq!(RefundDecision::forced(50).refund_amount(paid, &schedule), Money::won(35_000));
    // 20% would be 5_000 after fees; the floor lifts it.
    assert_eq!(RefundDecision::forced(20).refund_amount(paid, &schedule), Money::won(20_000));
    assert_eq!(RefundDecision::forced(0).refund_amount(paid, &schedule), Money::ZERO);
    // The floor never exceeds what was paid.
    assert_eq!(
        RefundDecision::forced(10).refund_amount(Money::won(15_000), &schedule),
        Money::won(15_000)
    );
}
