//! Booking saga reducer.
//!
//! Orchestrates one booking attempt:
//! 1. Reserve capacity on the slot
//! 2. Checkpoint the booking as `SAGA_PENDING` with a deadline
//! 3. Charge the payment gateway
//! 4. On approval: commit the reservation, then confirm the booking
//! 5. On decline or error: release the capacity (refunding if money may have
//!    moved), then fail the booking
//!
//! A live saga only compensates while it holds the booking's resolution
//! lease. Recovery runs are started by the watchdog, which already holds it.
//!
//! Every transition is a `(phase, action)` pair in [`Reducer::reduce`]; an
//! action that does not match the current phase is ignored. Effects talk to the
//! stores and the gateway and report back with exactly one action.

use super::action::{RecoveryOutcome, SagaAction};
use super::environment::{SagaEnvironment, SagaSettings};
use super::state::{SagaContext, SagaPhase, SagaState};
use crate::capacity::{ReleaseOutcome, ReserveRequest};
use crate::error::{CapacityError, GatewayError, RepositoryError};
use crate::metrics;
use crate::payment::{ChargeOutcome, GatewayFuture, PaymentGateway};
use crate::repository::{BookingRepository, BookingUpdate, HistoryAction};
use crate::types::{BookingId, BookingStatus, FailureReason, Money, ReservationId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use teetime_core::environment::Clock;
use teetime_core::{effect::Effect, reducer::Reducer, smallvec, Effects, SmallVec};
use teetime_runtime::retry::{retry_until_success, retry_with_predicate};
use tracing::Instrument;

const PENDING: &[BookingStatus] = &[BookingStatus::Pending];
const IN_FLIGHT: &[BookingStatus] = &[BookingStatus::Pending, BookingStatus::SagaPending];

/// Reducer for the booking saga.
#[derive(Clone, Copy, Debug, Default)]
pub struct BookingSagaReducer;

impl BookingSagaReducer {
    /// Creates a new `BookingSagaReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn enter(state: &mut SagaState, phase: SagaPhase) {
        if let Some(context) = &state.context {
            tracing::debug!(
                booking_id = %context.booking_id,
                from = ?state.phase,
                to = ?phase,
                "Saga phase change"
            );
        }
        state.phase = phase;
    }

    fn start_compensation(
        state: &mut SagaState,
        env: &SagaEnvironment,
        refund: bool,
        reason: FailureReason,
    ) -> Effects<SagaAction> {
        let Some(context) = state.context.clone() else {
            return SmallVec::new();
        };
        Self::enter(state, SagaPhase::Compensating { refund });
        state.failure = Some(reason.clone());
        let guard = if state.recovering {
            Ownership::Leased
        } else {
            Ownership::Claim {
                captured: state.transaction_id.is_some(),
            }
        };
        smallvec![compensate(env, &context, refund, reason, guard)]
    }

    fn start_failing(state: &mut SagaState, env: &SagaEnvironment) -> Effects<SagaAction> {
        let Some(context) = state.context.clone() else {
            return SmallVec::new();
        };
        Self::enter(state, SagaPhase::Failing);
        let reason = state.failure.clone().unwrap_or(FailureReason::Internal);
        let action = if reason == FailureReason::Timeout {
            HistoryAction::SagaTimeout
        } else {
            HistoryAction::SagaFailed
        };
        let mut update = BookingUpdate::new(BookingStatus::SagaFailed, action, env.clock.now())
            .with_failure(reason);
        if let Some(refunded) = state.refunded {
            update = update.with_refund(refunded);
        }
        smallvec![write_outcome(
            env,
            &context,
            update,
            state.started_at,
            false,
            SagaAction::BookingFailed
        )]
    }
}

impl Reducer for BookingSagaReducer {
    type State = SagaState;
    type Action = SagaAction;
    type Environment = SagaEnvironment;

    #[allow(clippy::too_many_lines)] // one arm per row of the transition table
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> Effects<Self::Action> {
        match (state.phase, action) {
            // ========== Entry points ==========
            (SagaPhase::Idle, SagaAction::Start { context }) => {
                let now = env.clock.now();
                tracing::info!(
                    booking_id = %context.booking_id,
                    time_slot_id = %context.time_slot_id,
                    player_count = context.player_count,
                    "Booking saga started"
                );
                let effect = reserve(env, &context, now);
                state.context = Some(context);
                state.started_at = Some(now);
                Self::enter(state, SagaPhase::Initiated);
                smallvec![effect]
            },

            (SagaPhase::Idle, SagaAction::Recover { context, outcome }) => {
                tracing::info!(
                    booking_id = %context.booking_id,
                    outcome = ?outcome,
                    "Recovering abandoned saga"
                );
                state.started_at = Some(env.clock.now());
                state.context = Some(context.clone());
                state.recovering = true;
                match outcome {
                    RecoveryOutcome::Confirm => {
                        Self::enter(state, SagaPhase::Confirming);
                        smallvec![commit(env, &context)]
                    },
                    RecoveryOutcome::Compensate { refund, reason } => {
                        Self::start_compensation(state, env, refund, reason)
                    },
                }
            },

            // ========== Capacity ==========
            (SagaPhase::Initiated, SagaAction::CapacityReserved { reservation_id }) => {
                let Some(context) = state.context.as_mut() else {
                    return SmallVec::new();
                };
                context.reservation_id = Some(reservation_id);
                let booking_id = context.booking_id;
                let now = env.clock.now();
                let deadline = now + env.settings.timeout;
                Self::enter(state, SagaPhase::CapacityReserved);
                smallvec![checkpoint(env, booking_id, reservation_id, deadline, now)]
            },

            (SagaPhase::Initiated, SagaAction::CapacityRejected { reason }) => {
                state.failure = Some(reason);
                Self::start_failing(state, env)
            },

            (SagaPhase::Initiated, SagaAction::CapacityUnreachable { error }) => {
                tracing::error!(error = %error, "Capacity store unreachable, compensating");
                Self::start_compensation(state, env, false, FailureReason::CapacityStoreUnavailable)
            },

            // ========== Checkpoint ==========
            (SagaPhase::CapacityReserved, SagaAction::PaymentRequested { deadline }) => {
                let Some(context) = state.context.clone() else {
                    return SmallVec::new();
                };
                state.deadline = Some(deadline);
                Self::enter(state, SagaPhase::PaymentInFlight);
                smallvec![charge(env, &context)]
            },

            (SagaPhase::CapacityReserved, SagaAction::CheckpointFailed { error }) => {
                tracing::error!(error = %error, "Checkpoint failed, compensating");
                Self::start_compensation(state, env, false, FailureReason::Internal)
            },

            // ========== Payment ==========
            (SagaPhase::PaymentInFlight, SagaAction::PaymentApproved { transaction_id }) => {
                let Some(context) = state.context.clone() else {
                    return SmallVec::new();
                };
                state.transaction_id = Some(transaction_id);
                Self::enter(state, SagaPhase::Confirming);
                smallvec![commit(env, &context)]
            },

            (SagaPhase::PaymentInFlight, SagaAction::PaymentDeclined { reason }) => {
                Self::start_compensation(state, env, false, FailureReason::PaymentDeclined { reason })
            },

            (SagaPhase::PaymentInFlight, SagaAction::PaymentErrored { error }) => {
                tracing::warn!(error = %error, "Payment failed, compensating with refund");
                Self::start_compensation(state, env, true, FailureReason::PaymentError)
            },

            (SagaPhase::PaymentInFlight, SagaAction::PaymentOutcomeUnknown) => {
                if let Some(context) = &state.context {
                    tracing::warn!(
                        booking_id = %context.booking_id,
                        deadline = ?state.deadline,
                        "Payment outcome unknown, leaving booking to the watchdog"
                    );
                }
                Self::enter(state, SagaPhase::AwaitingRecovery);
                SmallVec::new()
            },

            // ========== Confirmation ==========
            (SagaPhase::Confirming, SagaAction::CapacityCommitted) => {
                let Some(context) = state.context.clone() else {
                    return SmallVec::new();
                };
                let update = BookingUpdate::new(
                    BookingStatus::Confirmed,
                    HistoryAction::Confirmed,
                    env.clock.now(),
                );
                smallvec![write_outcome(
                    env,
                    &context,
                    update,
                    state.started_at,
                    state.transaction_id.is_some(),
                    SagaAction::BookingConfirmed
                )]
            },

            (SagaPhase::Confirming, SagaAction::CommitFailed { reservation_gone: true, error }) => {
                tracing::error!(error = %error, "Reservation released before commit, refunding");
                Self::start_compensation(state, env, true, FailureReason::Timeout)
            },

            (SagaPhase::Confirming, SagaAction::CommitFailed { reservation_gone: false, error }) => {
                tracing::error!(error = %error, "Commit failed, leaving booking to the watchdog");
                Self::enter(state, SagaPhase::AwaitingRecovery);
                SmallVec::new()
            },

            (SagaPhase::Confirming, SagaAction::BookingConfirmed) => {
                if let Some(context) = &state.context {
                    tracing::info!(booking_id = %context.booking_id, "Booking confirmed");
                }
                Self::enter(state, SagaPhase::Confirmed);
                SmallVec::new()
            },

            (SagaPhase::Confirming | SagaPhase::Failing, SagaAction::CheckpointFailed { error }) => {
                tracing::error!(error = %error, "Final write failed, leaving booking to the watchdog");
                Self::enter(state, SagaPhase::AwaitingRecovery);
                SmallVec::new()
            },

            // ========== Compensation ==========
            (SagaPhase::Compensating { .. }, SagaAction::CapacityReleased { refunded }) => {
                state.refunded = refunded;
                Self::start_failing(state, env)
            },

            (SagaPhase::Compensating { .. }, SagaAction::CompensationDeferred { error }) => {
                tracing::warn!(error = %error, "Compensation deferred to the watchdog");
                Self::enter(state, SagaPhase::AwaitingRecovery);
                SmallVec::new()
            },

            (SagaPhase::Failing, SagaAction::BookingFailed) => {
                if let Some(context) = &state.context {
                    tracing::info!(
                        booking_id = %context.booking_id,
                        reason = ?state.failure,
                        "Booking failed"
                    );
                }
                Self::enter(state, SagaPhase::Failed);
                SmallVec::new()
            },

            // ========== Lost race ==========
            (phase, SagaAction::TransitionConflict { current })
                if phase != SagaPhase::Idle && !phase.is_settled() =>
            {
                tracing::info!(current = %current, "Booking resolved elsewhere, saga stops");
                state.superseded_by = Some(current);
                Self::enter(state, SagaPhase::Superseded);
                SmallVec::new()
            },

            (phase, action) => {
                tracing::debug!(phase = ?phase, action = ?action, "Ignoring action");
                SmallVec::new()
            },
        }
    }
}

// ============================================================================
// Effects
// ============================================================================

async fn with_timeout<T>(limit: Duration, call: GatewayFuture<'_, T>) -> Result<T, GatewayError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(GatewayError::Timeout))
}

fn saga_span(operation: &'static str, booking_id: BookingId) -> tracing::Span {
    tracing::info_span!("saga", operation, booking_id = %booking_id)
}

fn reserve(env: &SagaEnvironment, context: &SagaContext, now: DateTime<Utc>) -> Effect<SagaAction> {
    let capacity = Arc::clone(&env.capacity);
    let settings = Arc::clone(&env.settings);
    let request = ReserveRequest {
        time_slot_id: context.time_slot_id,
        booking_id: context.booking_id,
        player_count: context.player_count,
        requested_at: now,
    };
    let span = saga_span("reserve", context.booking_id);

    Effect::future(
        async move {
            let result = retry_with_predicate(
                &settings.capacity_retry,
                "capacity.reserve",
                || capacity.reserve(request),
                CapacityError::is_transient,
            )
            .await;

            let (outcome, action) = match result {
                Ok(reservation) => (
                    "reserved",
                    SagaAction::CapacityReserved {
                        reservation_id: reservation.id,
                    },
                ),
                Err(CapacityError::CapacityExhausted { .. } | CapacityError::InvalidPlayerCount(_)) => (
                    "exhausted",
                    SagaAction::CapacityRejected {
                        reason: FailureReason::CapacityExhausted,
                    },
                ),
                Err(CapacityError::SlotUnavailable { .. } | CapacityError::SlotNotFound(_)) => (
                    "unavailable",
                    SagaAction::CapacityRejected {
                        reason: FailureReason::SlotUnavailable,
                    },
                ),
                Err(CapacityError::ReservationGone(_)) => (
                    "released",
                    SagaAction::CapacityRejected {
                        reason: FailureReason::Timeout,
                    },
                ),
                Err(err) => (
                    "error",
                    SagaAction::CapacityUnreachable {
                        error: err.to_string(),
                    },
                ),
            };
            metrics::record_capacity_reservation(outcome);
            Some(action)
        }
        .instrument(span),
    )
}

fn checkpoint(
    env: &SagaEnvironment,
    booking_id: BookingId,
    reservation_id: ReservationId,
    deadline: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Effect<SagaAction> {
    let repository = Arc::clone(&env.repository);
    let capacity = Arc::clone(&env.capacity);
    let settings = Arc::clone(&env.settings);
    let update = BookingUpdate::new(BookingStatus::SagaPending, HistoryAction::SlotReserved, now)
        .with_reservation(reservation_id)
        .with_deadline(deadline);
    let span = saga_span("checkpoint", booking_id);

    Effect::future(
        async move {
            let result = retry_with_predicate(
                &settings.repository_retry,
                "booking.checkpoint",
                || repository.transition(booking_id, PENDING, update.clone()),
                RepositoryError::is_transient,
            )
            .await;

            match result {
                Ok(_) => Some(SagaAction::PaymentRequested { deadline }),
                Err(RepositoryError::Conflict { current, .. }) => {
                    // The booking was resolved without us; the hold must not outlive it.
                    retry_until_success(
                        &settings.compensation_retry,
                        "capacity.release",
                        settings.compensation_alert_after,
                        || capacity.release(reservation_id),
                        |_, _| metrics::record_alert("compensation_stuck"),
                    )
                    .await;
                    Some(SagaAction::TransitionConflict { current })
                },
                Err(err) => Some(SagaAction::CheckpointFailed {
                    error: err.to_string(),
                }),
            }
        }
        .instrument(span),
    )
}

fn charge(env: &SagaEnvironment, context: &SagaContext) -> Effect<SagaAction> {
    let payments = Arc::clone(&env.payments);
    let settings = Arc::clone(&env.settings);
    let booking_id = context.booking_id;
    let amount = context.amount;
    let span = saga_span("charge", booking_id);

    Effect::future(
        async move {
            let call_timeout = settings.payment_call_timeout;
            let result = retry_with_predicate(
                &settings.payment_retry,
                "payment.charge",
                || with_timeout(call_timeout, payments.charge(booking_id, amount)),
                GatewayError::is_transient,
            )
            .await;

            Some(match result {
                Ok(ChargeOutcome::Approved { transaction_id }) => {
                    SagaAction::PaymentApproved { transaction_id }
                },
                Ok(ChargeOutcome::Declined { reason }) => SagaAction::PaymentDeclined { reason },
                Err(GatewayError::Timeout) => SagaAction::PaymentOutcomeUnknown,
                Err(err) => SagaAction::PaymentErrored {
                    error: err.to_string(),
                },
            })
        }
        .instrument(span),
    )
}

fn commit(env: &SagaEnvironment, context: &SagaContext) -> Effect<SagaAction> {
    let capacity = Arc::clone(&env.capacity);
    let settings = Arc::clone(&env.settings);
    let booking_id = context.booking_id;
    let known = context.reservation_id;
    let span = saga_span("commit", booking_id);

    Effect::future(
        async move {
            let reservation_id = match known {
                Some(id) => id,
                None => match capacity.reservation_for_booking(booking_id).await {
                    Ok(Some(reservation)) => reservation.id,
                    Ok(None) => {
                        return Some(SagaAction::CommitFailed {
                            reservation_gone: true,
                            error: "no reservation recorded for booking".to_string(),
                        });
                    },
                    Err(err) => {
                        return Some(SagaAction::CommitFailed {
                            reservation_gone: false,
                            error: err.to_string(),
                        });
                    },
                },
            };

            let result = retry_with_predicate(
                &settings.capacity_retry,
                "capacity.commit",
                || capacity.commit(reservation_id),
                CapacityError::is_transient,
            )
            .await;

            Some(match result {
                Ok(_) => SagaAction::CapacityCommitted,
                Err(
                    err @ (CapacityError::ReservationGone(_) | CapacityError::ReservationNotFound(_)),
                ) => SagaAction::CommitFailed {
                    reservation_gone: true,
                    error: err.to_string(),
                },
                Err(err) => SagaAction::CommitFailed {
                    reservation_gone: false,
                    error: err.to_string(),
                },
            })
        }
        .instrument(span),
    )
}

/// Who may undo a booking's side effects during compensation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Ownership {
    /// Live saga: win the resolution lease first, never undo a commit
    Claim {
        /// Our own charge was approved
        captured: bool,
    },
    /// Recovery run; the watchdog holds the lease
    Leased,
}

enum Claim {
    Won,
    Lost(BookingStatus),
    Unknown(String),
}

struct ClaimEnv {
    repository: Arc<dyn BookingRepository>,
    clock: Arc<dyn Clock>,
    settings: Arc<SagaSettings>,
}

/// Take the booking's resolution lease for the length of a saga.
async fn claim_lease(env: &ClaimEnv, booking_id: BookingId) -> Claim {
    let now = env.clock.now();
    let until = now + env.settings.timeout;
    let result = retry_with_predicate(
        &env.settings.repository_retry,
        "booking.claim",
        || env.repository.claim_resolution(booking_id, now, until),
        RepositoryError::is_transient,
    )
    .await;

    match result {
        Ok(true) => Claim::Won,
        Ok(false) => match env.repository.get(booking_id).await {
            Ok(booking) => Claim::Lost(booking.status),
            Err(err) => Claim::Unknown(err.to_string()),
        },
        Err(err) => Claim::Unknown(err.to_string()),
    }
}

/// Refund a charge, retrying until the gateway accepts.
async fn refund_charge(
    payments: &dyn PaymentGateway,
    settings: &SagaSettings,
    booking_id: BookingId,
    amount: Money,
) -> Money {
    let call_timeout = settings.payment_call_timeout;
    let receipt = retry_until_success(
        &settings.compensation_retry,
        "payment.refund",
        settings.compensation_alert_after,
        || with_timeout(call_timeout, payments.refund(booking_id, amount)),
        |_, _| metrics::record_alert("refund_failed"),
    )
    .await;
    metrics::record_refund(receipt.amount.amount());
    receipt.amount
}

/// Another resolver failed the booking after our charge went through.
async fn refund_lost_charge(
    payments: &dyn PaymentGateway,
    settings: &SagaSettings,
    booking_id: BookingId,
    amount: Money,
    current: BookingStatus,
) {
    if current != BookingStatus::SagaFailed {
        return;
    }
    let refunded = refund_charge(payments, settings, booking_id, amount).await;
    tracing::warn!(
        refunded = refunded.amount(),
        "Booking failed elsewhere after our charge was approved, refunded"
    );
}

fn compensate(
    env: &SagaEnvironment,
    context: &SagaContext,
    refund: bool,
    reason: FailureReason,
    ownership: Ownership,
) -> Effect<SagaAction> {
    let capacity = Arc::clone(&env.capacity);
    let payments = Arc::clone(&env.payments);
    let settings = Arc::clone(&env.settings);
    let claim_env = ClaimEnv {
        repository: Arc::clone(&env.repository),
        clock: Arc::clone(&env.clock),
        settings: Arc::clone(&env.settings),
    };
    let booking_id = context.booking_id;
    let amount = context.amount;
    let span = saga_span("compensate", booking_id);

    Effect::future(
        async move {
            let policy = &settings.compensation_retry;
            let alert_after = settings.compensation_alert_after;

            if let Ownership::Claim { captured } = ownership {
                match claim_lease(&claim_env, booking_id).await {
                    Claim::Won => {},
                    Claim::Lost(current) => {
                        if captured {
                            refund_lost_charge(payments.as_ref(), &settings, booking_id, amount, current).await;
                        }
                        return Some(SagaAction::TransitionConflict { current });
                    },
                    Claim::Unknown(error) => return Some(SagaAction::CompensationDeferred { error }),
                }
            }

            let mut released = retry_until_success(
                policy,
                "capacity.release",
                alert_after,
                || capacity.release_for_booking(booking_id),
                |_, _| metrics::record_alert("compensation_stuck"),
            )
            .await;

            if released == ReleaseOutcome::AlreadyCommitted {
                if ownership != Ownership::Leased {
                    // Committed by a resolver that saw the charge approved.
                    if let Err(err) = claim_env.repository.release_claim(booking_id).await {
                        tracing::warn!(error = %err, "Failed to release claim");
                    }
                    return Some(SagaAction::CompensationDeferred {
                        error: "reservation already committed".to_string(),
                    });
                }
                released = retry_until_success(
                    policy,
                    "capacity.cancel_committed",
                    alert_after,
                    || capacity.cancel_committed(booking_id),
                    |_, _| metrics::record_alert("compensation_stuck"),
                )
                .await;
            }

            let refunded = if refund {
                Some(refund_charge(payments.as_ref(), &settings, booking_id, amount).await)
            } else {
                None
            };

            metrics::record_compensation(reason.code());
            tracing::info!(
                freed_seats = released.freed_seats(),
                refunded = ?refunded.map(Money::amount),
                reason = reason.code(),
                "Compensation finished"
            );
            Some(SagaAction::CapacityReleased { refunded })
        }
        .instrument(span),
    )
}

/// CAS the booking out of the in-flight statuses and report `on_success`.
///
/// With `captured` set, losing the CAS to a failed booking refunds our charge.
fn write_outcome(
    env: &SagaEnvironment,
    context: &SagaContext,
    update: BookingUpdate,
    started_at: Option<DateTime<Utc>>,
    captured: bool,
    on_success: SagaAction,
) -> Effect<SagaAction> {
    let repository = Arc::clone(&env.repository);
    let payments = Arc::clone(&env.payments);
    let clock = Arc::clone(&env.clock);
    let settings = Arc::clone(&env.settings);
    let booking_id = context.booking_id;
    let amount = context.amount;
    let span = saga_span("finish", booking_id);

    Effect::future(
        async move {
            let status = update.status;
            let result = retry_with_predicate(
                &settings.repository_retry,
                "booking.finish",
                || repository.transition(booking_id, IN_FLIGHT, update.clone()),
                RepositoryError::is_transient,
            )
            .await;

            match result {
                Ok(_) => {
                    metrics::record_booking(status.as_str());
                    if let Some(started_at) = started_at {
                        #[allow(clippy::cast_precision_loss)] // saga durations are small
                        let seconds = (clock.now() - started_at).num_milliseconds() as f64 / 1_000.0;
                        metrics::record_saga_duration(seconds);
                    }
                    Some(on_success)
                },
                Err(RepositoryError::Conflict { current, .. }) => {
                    if captured {
                        refund_lost_charge(payments.as_ref(), &settings, booking_id, amount, current).await;
                    }
                    Some(SagaAction::TransitionConflict { current })
                },
                Err(err) => Some(SagaAction::CheckpointFailed {
                    error: err.to_string(),
                }),
            }
        }
        .instrument(span),
    )
}
