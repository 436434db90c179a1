//! Booking facade: starts sagas, answers queries, cancels bookings.
//!
//! `start_booking` runs the saga inline and waits a bounded time for it to
//! settle. A saga that outlives the wait keeps running in the background and
//! the caller gets `SAGA_PENDING` to poll.

use crate::capacity::{CapacityStore, InMemoryCapacityStore};
use crate::catalog::SlotCatalog;
use crate::config::Config;
use crate::error::{BookingError, BookingResult, CatalogError, RepositoryError};
use crate::idempotency::{
    GuardDecision, IdempotencyGuard, IdempotencyStore, InMemoryIdempotencyStore, RequestFingerprint,
};
use crate::metrics;
use crate::payment::{MockPaymentGateway, PaymentGateway};
use crate::policy::{evaluate, CancellationPolicy, RefundDecision};
use crate::repository::{BookingRepository, BookingUpdate, HistoryAction, HistoryEntry, InMemoryBookingRepository};
use crate::saga::{saga_store, SagaAction, SagaContext, SagaEnvironment, SagaPhase, SagaSettings, SagaState, SagaStore};
use crate::types::{
    Booking, BookingId, BookingNumber, BookingStatus, FailureReason, IdempotencyKey, Money, SlotStatus,
    TimeSlot, TimeSlotId, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use teetime_core::environment::Clock;
use teetime_runtime::error::StoreError;
use teetime_runtime::retry::retry_until_success;
use teetime_runtime::{HealthCheck, HealthReport};

/// How long a detached saga may keep running before its registry entry is dropped.
const DETACHED_SAGA_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Ports the service talks to.
#[derive(Clone)]
pub struct Stores {
    /// Seat counter authority
    pub capacity: Arc<dyn CapacityStore>,
    /// Slot metadata
    pub catalog: Arc<dyn SlotCatalog>,
    /// Booking rows
    pub repository: Arc<dyn BookingRepository>,
    /// Idempotency records
    pub idempotency: Arc<dyn IdempotencyStore>,
    /// Outbound payments
    pub payments: Arc<dyn PaymentGateway>,
}

impl Stores {
    /// In-memory stores around an existing capacity store.
    #[must_use]
    pub fn in_memory(capacity: Arc<InMemoryCapacityStore>, payments: Arc<dyn PaymentGateway>) -> Self {
        Self {
            capacity: capacity.clone(),
            catalog: capacity,
            repository: Arc::new(InMemoryBookingRepository::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            payments,
        }
    }
}

impl Default for Stores {
    fn default() -> Self {
        Self::in_memory(
            Arc::new(InMemoryCapacityStore::new()),
            Arc::new(MockPaymentGateway::new()),
        )
    }
}

/// Inbound booking request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartBookingRequest {
    /// Who books
    pub user_id: UserId,
    /// Which slot
    pub time_slot_id: TimeSlotId,
    /// Seats wanted
    pub player_count: u32,
    /// Client-supplied retry token
    pub idempotency_key: String,
}

/// Why a request was answered from an earlier attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayKind {
    /// The earlier saga is still running
    InFlight,
    /// The earlier saga already finished
    Terminal,
}

impl ReplayKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::InFlight => "in_flight",
            Self::Terminal => "terminal",
        }
    }
}

/// Answer to a booking request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartBookingResponse {
    /// Booking id
    pub booking_id: BookingId,
    /// Booking number, once the row exists
    pub booking_number: Option<BookingNumber>,
    /// `CONFIRMED`, `SAGA_PENDING` or `SAGA_FAILED` (or a later status on replay)
    pub status: BookingStatus,
    /// Why it failed
    pub failure_reason: Option<FailureReason>,
    /// Set when this answer replays an earlier attempt
    pub replay: Option<ReplayKind>,
}

impl StartBookingResponse {
    fn from_booking(booking: &Booking, replay: Option<ReplayKind>) -> Self {
        Self {
            booking_id: booking.id,
            booking_number: Some(booking.booking_number.clone()),
            status: visible_status(booking.status),
            failure_reason: booking.failure_reason.clone(),
            replay,
        }
    }
}

/// `PENDING` is an internal checkpoint; callers see it as `SAGA_PENDING`.
const fn visible_status(status: BookingStatus) -> BookingStatus {
    match status {
        BookingStatus::Pending => BookingStatus::SagaPending,
        other => other,
    }
}

/// Result of a cancellation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationResult {
    /// Booking after cancellation
    pub booking: Booking,
    /// Rate applied
    pub refund_rate_percent: u32,
    /// Amount refunded
    pub refund_amount: Money,
}

/// Who asked for a cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Canceller {
    User,
    Admin,
    System,
}

impl Canceller {
    const fn history_action(self) -> HistoryAction {
        match self {
            Self::User => HistoryAction::Cancelled,
            Self::Admin => HistoryAction::AdminCancelled,
            Self::System => HistoryAction::SystemCancelled,
        }
    }
}

/// The booking service.
pub struct BookingService {
    stores: Stores,
    guard: IdempotencyGuard,
    saga_env: SagaEnvironment,
    clock: Arc<dyn Clock>,
    policy: CancellationPolicy,
    response_wait: Duration,
    running: Arc<Mutex<HashMap<BookingId, SagaStore>>>,
}

impl BookingService {
    /// Wire the service from its ports and configuration.
    #[must_use]
    pub fn new(stores: Stores, clock: Arc<dyn Clock>, config: &Config) -> Self {
        let settings = SagaSettings::from(&config.saga);
        let guard = IdempotencyGuard::new(
            Arc::clone(&stores.idempotency),
            Arc::clone(&stores.repository),
            config.idempotency.ttl(),
            settings.timeout,
        );
        let saga_env = SagaEnvironment::new(
            Arc::clone(&stores.capacity),
            Arc::clone(&stores.repository),
            Arc::clone(&stores.payments),
            Arc::clone(&clock),
            settings,
        );
        Self {
            stores,
            guard,
            saga_env,
            clock,
            policy: CancellationPolicy::from(&config.policy),
            response_wait: config.saga.response_wait(),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replace the cancellation policy.
    #[must_use]
    pub fn with_policy(mut self, policy: CancellationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The saga environment, shared with the watchdog.
    #[must_use]
    pub fn saga_environment(&self) -> SagaEnvironment {
        self.saga_env.clone()
    }

    /// The idempotency guard, shared with the watchdog for key purging.
    #[must_use]
    pub fn idempotency_guard(&self) -> IdempotencyGuard {
        self.guard.clone()
    }

    /// The ports this service was built with.
    #[must_use]
    pub const fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Start (or replay) a booking.
    ///
    /// # Errors
    ///
    /// Validation failures, an unknown or past slot, idempotency key reuse and
    /// infrastructure failures before the saga starts. Business outcomes of
    /// the saga are not errors; they come back as `SAGA_FAILED`.
    #[tracing::instrument(
        skip(self, request),
        fields(user_id = %request.user_id, time_slot_id = %request.time_slot_id)
    )]
    pub async fn start_booking(&self, request: StartBookingRequest) -> BookingResult<StartBookingResponse> {
        let key = IdempotencyKey::parse(&request.idempotency_key)?;
        if request.player_count == 0 {
            return Err(BookingError::Validation(
                "player_count must be at least 1".to_string(),
            ));
        }

        let now = self.clock.now();
        let snapshot = self
            .stores
            .catalog
            .snapshot(request.time_slot_id)
            .await
            .map_err(|err| match err {
                CatalogError::SlotNotFound(id) => BookingError::SlotNotFound(id),
                other => BookingError::Catalog(other),
            })?;
        if snapshot.starts_at <= now {
            return Err(BookingError::SlotInPast(request.time_slot_id));
        }
        if request.player_count > snapshot.max_players {
            return Err(BookingError::Validation(format!(
                "player_count must be between 1 and {}",
                snapshot.max_players
            )));
        }

        let fingerprint = RequestFingerprint {
            time_slot_id: request.time_slot_id,
            player_count: request.player_count,
        };
        let candidate = BookingId::new();
        match self
            .guard
            .check_or_reserve(request.user_id, &key, fingerprint, candidate, now)
            .await?
        {
            GuardDecision::FirstSeen => {},
            GuardDecision::AlreadyInFlight(booking_id) => {
                return self.replay(booking_id, ReplayKind::InFlight).await;
            },
            GuardDecision::AlreadyTerminal { booking_id, .. } => {
                return self.replay(booking_id, ReplayKind::Terminal).await;
            },
        }

        let booking_number = BookingNumber::generate(now, &mut rand::thread_rng());
        let booking = Booking::pending(
            candidate,
            booking_number,
            request.user_id,
            &snapshot,
            request.player_count,
            now,
        );
        self.stores.repository.insert(booking.clone()).await?;
        tracing::info!(
            booking_id = %booking.id,
            booking_number = %booking.booking_number,
            amount = booking.amount.amount(),
            "Booking created"
        );

        let state = self
            .run_saga(
                booking.id,
                SagaAction::Start {
                    context: SagaContext::from_booking(&booking),
                },
            )
            .await?;

        match state.phase {
            SagaPhase::Confirmed => Ok(StartBookingResponse {
                status: BookingStatus::Confirmed,
                failure_reason: None,
                ..StartBookingResponse::from_booking(&booking, None)
            }),
            SagaPhase::Failed => Ok(StartBookingResponse {
                status: BookingStatus::SagaFailed,
                failure_reason: state.failure,
                ..StartBookingResponse::from_booking(&booking, None)
            }),
            SagaPhase::Superseded => {
                let current = self.stores.repository.get(booking.id).await?;
                Ok(StartBookingResponse::from_booking(&current, None))
            },
            _ => Ok(StartBookingResponse {
                status: BookingStatus::SagaPending,
                ..StartBookingResponse::from_booking(&booking, None)
            }),
        }
    }

    async fn replay(&self, booking_id: BookingId, kind: ReplayKind) -> BookingResult<StartBookingResponse> {
        metrics::record_idempotent_replay(kind.as_str());
        tracing::info!(booking_id = %booking_id, kind = kind.as_str(), "Replaying earlier booking attempt");
        match self.stores.repository.get(booking_id).await {
            Ok(booking) => Ok(StartBookingResponse::from_booking(&booking, Some(kind))),
            Err(RepositoryError::NotFound(_)) => Ok(StartBookingResponse {
                booking_id,
                booking_number: None,
                status: BookingStatus::SagaPending,
                failure_reason: None,
                replay: Some(kind),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Run a saga until it settles or the response wait runs out.
    async fn run_saga(&self, booking_id: BookingId, action: SagaAction) -> BookingResult<SagaState> {
        let store = saga_store(self.saga_env.clone());
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(booking_id, store.clone());

        let waited = store
            .send_and_wait_for_state(action, SagaState::is_settled, self.response_wait)
            .await;
        let state = store.state(SagaState::clone).await;

        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            if store.settle(DETACHED_SAGA_LIMIT).await.is_err() {
                tracing::error!(booking_id = %booking_id, "Detached saga never settled");
            }
            running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&booking_id);
        });

        match waited {
            Ok(()) => Ok(state),
            Err(StoreError::Timeout) => {
                tracing::info!(
                    booking_id = %booking_id,
                    phase = ?state.phase,
                    "Saga still running, answering SAGA_PENDING"
                );
                Ok(state)
            },
            Err(err) => Err(BookingError::Internal(err.to_string())),
        }
    }

    /// Look up a booking.
    ///
    /// # Errors
    ///
    /// [`BookingError::BookingNotFound`] for an unknown id.
    pub async fn get_booking(&self, booking_id: BookingId) -> BookingResult<Booking> {
        self.stores
            .repository
            .get(booking_id)
            .await
            .map_err(|err| not_found(err, booking_id))
    }

    /// Look up a booking by its external number.
    ///
    /// # Errors
    ///
    /// [`BookingError::Validation`] for a malformed number,
    /// [`BookingError::BookingNotFound`] for an unknown one.
    pub async fn get_booking_by_number(&self, number: &str) -> BookingResult<Booking> {
        let number = BookingNumber::parse(number)?;
        self.stores
            .repository
            .get_by_number(&number)
            .await?
            .ok_or_else(|| BookingError::BookingNotFound(number.to_string()))
    }

    /// Audit trail of a booking.
    ///
    /// # Errors
    ///
    /// [`BookingError::BookingNotFound`] for an unknown id.
    pub async fn history(&self, booking_id: BookingId) -> BookingResult<Vec<HistoryEntry>> {
        self.get_booking(booking_id).await?;
        Ok(self.stores.repository.history(booking_id).await?)
    }

    /// Cancel a confirmed booking on behalf of its owner.
    ///
    /// # Errors
    ///
    /// [`BookingError::BookingNotFound`] if the booking does not exist or
    /// belongs to someone else, [`BookingError::CancellationDenied`] when the
    /// policy refuses.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_booking(
        &self,
        booking_id: BookingId,
        user_id: UserId,
        reason: Option<String>,
    ) -> BookingResult<CancellationResult> {
        let booking = self.get_booking(booking_id).await?;
        if booking.user_id != user_id {
            return Err(BookingError::BookingNotFound(booking_id.to_string()));
        }

        let decision = evaluate(&booking, &self.policy, self.clock.now());
        if let Some(denial) = decision.denial {
            return Err(BookingError::CancellationDenied(denial.message().to_string()));
        }
        self.cancel(booking, &decision, Canceller::User, reason).await
    }

    /// Force-cancel a confirmed booking with an explicit refund rate.
    ///
    /// `refund_rate_percent` defaults to the schedule's admin rate.
    ///
    /// # Errors
    ///
    /// [`BookingError::InvalidState`] unless the booking is `CONFIRMED`.
    #[tracing::instrument(skip(self))]
    pub async fn admin_cancel(
        &self,
        booking_id: BookingId,
        refund_rate_percent: Option<u32>,
        reason: Option<String>,
    ) -> BookingResult<CancellationResult> {
        let booking = self.get_booking(booking_id).await?;
        let rate = refund_rate_percent.unwrap_or(self.policy.schedule.admin_cancel_refund_rate);
        self.cancel(booking, &RefundDecision::forced(rate), Canceller::Admin, reason)
            .await
    }

    /// Cancel a confirmed booking because the course cannot host it.
    ///
    /// # Errors
    ///
    /// [`BookingError::InvalidState`] unless the booking is `CONFIRMED`.
    #[tracing::instrument(skip(self))]
    pub async fn system_cancel(&self, booking_id: BookingId, reason: String) -> BookingResult<CancellationResult> {
        let booking = self.get_booking(booking_id).await?;
        let decision = RefundDecision::forced(self.policy.schedule.system_cancel_refund_rate);
        self.cancel(booking, &decision, Canceller::System, Some(reason)).await
    }

    async fn cancel(
        &self,
        booking: Booking,
        decision: &RefundDecision,
        canceller: Canceller,
        reason: Option<String>,
    ) -> BookingResult<CancellationResult> {
        if booking.status != BookingStatus::Confirmed {
            return Err(BookingError::InvalidState {
                status: booking.status,
            });
        }

        let now = self.clock.now();
        let refund = decision.refund_amount(booking.amount, &self.policy.schedule);
        let mut update = BookingUpdate::new(BookingStatus::Cancelled, canceller.history_action(), now)
            .with_cancelled_at(now)
            .with_refund(refund);
        if let Some(reason) = reason {
            update = update.with_details(reason);
        }

        let cancelled = self
            .stores
            .repository
            .transition(booking.id, &[BookingStatus::Confirmed], update)
            .await
            .map_err(|err| match err {
                RepositoryError::Conflict { current, .. } => BookingError::InvalidState { status: current },
                other => other.into(),
            })?;

        // The booking is CANCELLED from here on; seats and money must follow.
        let settings = &self.saga_env.settings;
        let capacity = &self.stores.capacity;
        let released = retry_until_success(
            &settings.compensation_retry,
            "capacity.cancel_committed",
            settings.compensation_alert_after,
            || capacity.cancel_committed(booking.id),
            |_, _| metrics::record_alert("compensation_stuck"),
        )
        .await;

        if !refund.is_zero() {
            let payments = &self.stores.payments;
            retry_until_success(
                &settings.compensation_retry,
                "payment.refund",
                settings.compensation_alert_after,
                || payments.refund(booking.id, refund),
                |_, _| metrics::record_alert("refund_failed"),
            )
            .await;
            metrics::record_refund(refund.amount());
        }

        metrics::record_booking(BookingStatus::Cancelled.as_str());
        tracing::info!(
            booking_id = %booking.id,
            by = ?canceller,
            freed_seats = released.freed_seats(),
            refund = refund.amount(),
            "Booking cancelled"
        );

        Ok(CancellationResult {
            booking: cancelled,
            refund_rate_percent: decision.refund_rate_percent,
            refund_amount: refund,
        })
    }

    /// Current state of a slot.
    ///
    /// # Errors
    ///
    /// [`BookingError::SlotNotFound`] for an unknown slot.
    pub async fn availability(&self, time_slot_id: TimeSlotId) -> BookingResult<TimeSlot> {
        self.stores
            .capacity
            .slot(time_slot_id)
            .await
            .map_err(|err| slot_not_found(err.into(), time_slot_id))
    }

    /// Publish a new slot.
    ///
    /// # Errors
    ///
    /// Capacity store failures, including a duplicate id.
    pub async fn publish_slot(&self, slot: TimeSlot) -> BookingResult<TimeSlot> {
        Ok(self.stores.capacity.publish(slot).await?)
    }

    /// Close, put under maintenance, or reopen a slot.
    ///
    /// # Errors
    ///
    /// [`BookingError::SlotNotFound`] for an unknown slot.
    pub async fn set_slot_status(&self, time_slot_id: TimeSlotId, status: SlotStatus) -> BookingResult<TimeSlot> {
        self.stores
            .capacity
            .set_status(time_slot_id, status)
            .await
            .map_err(|err| slot_not_found(err.into(), time_slot_id))
    }

    /// Number of sagas still running in this process.
    #[must_use]
    pub fn running_sagas(&self) -> usize {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Readiness of the service and its stores.
    pub async fn health(&self) -> HealthReport {
        let capacity = match self.stores.capacity.ping().await {
            Ok(()) => HealthCheck::healthy("capacity_store"),
            Err(err) => HealthCheck::unhealthy("capacity_store", err.to_string()),
        };
        let repository = match self.stores.repository.ping().await {
            Ok(()) => HealthCheck::healthy("booking_repository"),
            Err(err) => HealthCheck::unhealthy("booking_repository", err.to_string()),
        };
        let sagas = HealthCheck::healthy("sagas")
            .with_metadata("running", self.running_sagas().to_string());
        HealthReport::new(vec![capacity, repository, sagas])
    }

    /// Stop accepting work on running sagas and wait for their effects.
    ///
    /// # Errors
    ///
    /// [`StoreError::ShutdownTimeout`] if some saga did not finish in time.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
        let stores: Vec<SagaStore> = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        tracing::info!(running = stores.len(), "Waiting for running sagas");

        let results = futures::future::join_all(stores.iter().map(|store| store.shutdown(timeout))).await;
        results.into_iter().collect()
    }
}

fn not_found(err: RepositoryError, booking_id: BookingId) -> BookingError {
    match err {
        RepositoryError::NotFound(_) => BookingError::BookingNotFound(booking_id.to_string()),
        other => other.into(),
    }
}

fn slot_not_found(err: BookingError, time_slot_id: TimeSlotId) -> BookingError {
    match err {
        BookingError::Capacity(crate::error::CapacityError::SlotNotFound(_)) => {
            BookingError::SlotNotFound(time_slot_id)
        },
        other => other,
    }
}
