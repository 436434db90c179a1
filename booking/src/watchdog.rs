//! Timeout watchdog: resolves sagas nobody is driving any more.
//!
//! Each sweep:
//!
//! 1. finds `SAGA_PENDING` bookings past their deadline and asks the gateway
//!    what happened to the charge,
//! 2. fails `PENDING` bookings older than the saga timeout (the process died
//!    before the checkpoint),
//! 3. purges expired idempotency records.
//!
//! Every booking is claimed with a lease first, so two watchdogs (or a
//! watchdog and a late saga) never resolve the same booking twice.

use crate::config::WatchdogConfig;
use crate::error::RepositoryError;
use crate::idempotency::IdempotencyGuard;
use crate::metrics;
use crate::payment::ChargeStatus;
use crate::saga::{saga_store, RecoveryOutcome, SagaAction, SagaContext, SagaEnvironment, SagaPhase, SagaState};
use crate::types::{Booking, FailureReason};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;

/// Outcome counts of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Bookings the sweep looked at
    pub examined: usize,
    /// Resolved to `CONFIRMED`
    pub confirmed: usize,
    /// Resolved to `SAGA_FAILED`
    pub failed: usize,
    /// Left for a later sweep
    pub deferred: usize,
    /// Claimed by someone else first
    pub skipped: usize,
    /// Idempotency records removed
    pub purged_keys: u64,
}

/// Watchdog knobs.
#[derive(Clone, Debug)]
pub struct WatchdogSettings {
    /// Time between sweeps
    pub interval: Duration,
    /// How long past the deadline an unknown charge is waited on
    pub grace_period: chrono::Duration,
    /// Resolution lease length
    pub lease: chrono::Duration,
    /// Bookings per query
    pub batch_size: u32,
    /// How long one recovery may run before the sweep moves on
    pub resolve_timeout: Duration,
}

impl From<&WatchdogConfig> for WatchdogSettings {
    fn from(config: &WatchdogConfig) -> Self {
        let lease = config.lease();
        Self {
            interval: config.interval(),
            grace_period: config.grace_period(),
            lease,
            batch_size: config.batch_size,
            resolve_timeout: lease.to_std().unwrap_or(Duration::from_secs(60)),
        }
    }
}

/// What the gateway answer means for an expired saga.
fn decide(
    status: &ChargeStatus,
    deadline: DateTime<Utc>,
    grace: chrono::Duration,
    now: DateTime<Utc>,
) -> Option<RecoveryOutcome> {
    match status {
        ChargeStatus::Approved { .. } => Some(RecoveryOutcome::Confirm),
        ChargeStatus::Declined { reason } => Some(RecoveryOutcome::Compensate {
            refund: false,
            reason: FailureReason::PaymentDeclined {
                reason: reason.clone(),
            },
        }),
        ChargeStatus::NotFound => Some(RecoveryOutcome::Compensate {
            refund: false,
            reason: FailureReason::Timeout,
        }),
        ChargeStatus::Unknown if now > deadline + grace => Some(RecoveryOutcome::Compensate {
            refund: true,
            reason: FailureReason::Timeout,
        }),
        ChargeStatus::Unknown => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Resolution {
    Confirmed,
    Failed,
    Deferred,
    Skipped,
}

/// The timeout watchdog.
#[derive(Clone)]
pub struct Watchdog {
    env: SagaEnvironment,
    guard: IdempotencyGuard,
    settings: WatchdogSettings,
}

impl Watchdog {
    /// Build a watchdog sharing the saga environment of the booking service.
    #[must_use]
    pub const fn new(env: SagaEnvironment, guard: IdempotencyGuard, settings: WatchdogSettings) -> Self {
        Self { env, guard, settings }
    }

    /// Run sweeps every `interval` until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.settings.interval, "Watchdog started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep(self.env.clock.now()).await;
                    if report != SweepReport::default() {
                        tracing::info!(?report, "Watchdog sweep finished");
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                },
            }
        }
        tracing::info!("Watchdog stopped");
    }

    /// One pass over expired sagas, stale `PENDING` rows and expired keys.
    ///
    /// Infrastructure errors are logged and the booking is left for the next
    /// sweep; a sweep never fails as a whole.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        match self
            .env
            .repository
            .find_expired_sagas(now, self.settings.batch_size)
            .await
        {
            Ok(expired) => {
                for booking in expired {
                    report.examined += 1;
                    let resolution = self.resolve_expired(&booking, now).await;
                    tally(&mut report, resolution);
                }
            },
            Err(err) => tracing::error!(error = %err, "Failed to query expired sagas"),
        }

        let created_before = now - self.env.settings.timeout;
        match self
            .env
            .repository
            .find_stale_pending(created_before, now, self.settings.batch_size)
            .await
        {
            Ok(stale) => {
                for booking in stale {
                    report.examined += 1;
                    let resolution = self.resolve_stale_pending(&booking, now).await;
                    tally(&mut report, resolution);
                }
            },
            Err(err) => tracing::error!(error = %err, "Failed to query stale PENDING bookings"),
        }

        match self.guard.purge_expired(now).await {
            Ok(purged) => report.purged_keys = purged,
            Err(err) => tracing::warn!(error = %err, "Failed to purge idempotency keys"),
        }

        report
    }

    async fn claim(&self, booking: &Booking, now: DateTime<Utc>) -> bool {
        match self
            .env
            .repository
            .claim_resolution(booking.id, now, now + self.settings.lease)
            .await
        {
            Ok(claimed) => claimed,
            Err(RepositoryError::NotFound(_)) => false,
            Err(err) => {
                tracing::warn!(booking_id = %booking.id, error = %err, "Failed to claim booking");
                false
            },
        }
    }

    async fn unclaim(&self, booking: &Booking) {
        if let Err(err) = self.env.repository.release_claim(booking.id).await {
            // The lease expires on its own.
            tracing::warn!(booking_id = %booking.id, error = %err, "Failed to release claim");
        }
    }

    async fn resolve_expired(&self, booking: &Booking, now: DateTime<Utc>) -> Resolution {
        if !self.claim(booking, now).await {
            return Resolution::Skipped;
        }

        let status = match self.env.payments.charge_status(booking.id).await {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(booking_id = %booking.id, error = %err, "Charge status lookup failed");
                ChargeStatus::Unknown
            },
        };
        let deadline = booking.saga_deadline.unwrap_or(booking.updated_at);

        let Some(outcome) = decide(&status, deadline, self.settings.grace_period, now) else {
            tracing::info!(booking_id = %booking.id, "Charge outcome still unknown, deferring");
            self.unclaim(booking).await;
            return Resolution::Deferred;
        };
        self.recover(booking, outcome).await
    }

    async fn resolve_stale_pending(&self, booking: &Booking, now: DateTime<Utc>) -> Resolution {
        if !self.claim(booking, now).await {
            return Resolution::Skipped;
        }
        tracing::info!(booking_id = %booking.id, "Failing booking stuck before its checkpoint");
        self.recover(
            booking,
            RecoveryOutcome::Compensate {
                refund: false,
                reason: FailureReason::Timeout,
            },
        )
        .await
    }

    async fn recover(&self, booking: &Booking, outcome: RecoveryOutcome) -> Resolution {
        let store = saga_store(self.env.clone());
        let action = SagaAction::Recover {
            context: SagaContext::from_booking(booking),
            outcome,
        };
        if let Err(err) = store
            .send_and_wait_for_state(action, SagaState::is_settled, self.settings.resolve_timeout)
            .await
        {
            // The lease keeps other resolvers away until it runs out.
            tracing::warn!(booking_id = %booking.id, error = %err, "Recovery did not settle in time");
            return Resolution::Deferred;
        }

        match store.state(|s| s.phase).await {
            SagaPhase::Confirmed => {
                metrics::record_watchdog_resolution("confirmed");
                Resolution::Confirmed
            },
            SagaPhase::Failed => {
                metrics::record_watchdog_resolution("failed");
                Resolution::Failed
            },
            SagaPhase::Superseded => Resolution::Skipped,
            _ => {
                self.unclaim(booking).await;
                Resolution::Deferred
            },
        }
    }
}

fn tally(report: &mut SweepReport, resolution: Resolution) {
    match resolution {
        Resolution::Confirmed => report.confirmed += 1,
        Resolution::Failed => report.failed += 1,
        Resolution::Deferred => report.deferred += 1,
        Resolution::Skipped => report.skipped += 1,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use teetime_testing::test_instant;

    #[test]
    fn test_decide_follows_gateway_answer() {
        let deadline = test_instant();
        let grace = ChronoDuration::minutes(5);

        assert_eq!(
            decide(
                &ChargeStatus::Approved {
                    transaction_id: "tx".to_string()
                },
                deadline,
                grace,
                deadline
            ),
            Some(RecoveryOutcome::Confirm)
        );
        assert!(matches!(
            decide(&ChargeStatus::NotFound, deadline, grace, deadline),
            Some(RecoveryOutcome::Compensate { refund: false, reason: FailureReason::Timeout })
        ));
        assert!(matches!(
            decide(&ChargeStatus::Declined { reason: "no".to_string() }, deadline, grace, deadline),
            Some(RecoveryOutcome::Compensate {
                refund: false,
                reason: FailureReason::PaymentDeclined { .. }
            })
        ));
    }

    #[test]
    fn test_unknown_charge_waits_out_grace_period() {
        let deadline = test_instant();
        let grace = ChronoDuration::minutes(5);

        assert_eq!(
            decide(&ChargeStatus::Unknown, deadline, grace, deadline + ChronoDuration::minutes(1)),
            None
        );
        assert_eq!(
            decide(&ChargeStatus::Unknown, deadline, grace, deadline + ChronoDuration::minutes(6)),
            Some(RecoveryOutcome::Compensate {
                refund: true,
                reason: FailureReason::Timeout
            })
        );
    }
}
