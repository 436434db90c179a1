//! Dependencies injected into the saga reducer.

use crate::capacity::CapacityStore;
use crate::config::SagaConfig;
use crate::payment::PaymentGateway;
use crate::repository::BookingRepository;
use std::sync::Arc;
use std::time::Duration;
use teetime_core::environment::Clock;
use teetime_runtime::RetryPolicy;

/// Retry and timeout knobs for saga effects.
#[derive(Debug, Clone)]
pub struct SagaSettings {
    /// Saga deadline after the `SAGA_PENDING` checkpoint
    pub timeout: chrono::Duration,
    /// Reserving capacity: bounded attempts and total time
    pub capacity_retry: RetryPolicy,
    /// Charging: bounded attempts on transient gateway errors
    pub payment_retry: RetryPolicy,
    /// Timeout of a single gateway call
    pub payment_call_timeout: Duration,
    /// Checkpoint writes
    pub repository_retry: RetryPolicy,
    /// Compensation steps; retried until they succeed
    pub compensation_retry: RetryPolicy,
    /// Consecutive compensation failures before alerting
    pub compensation_alert_after: u32,
}

impl From<&SagaConfig> for SagaSettings {
    fn from(config: &SagaConfig) -> Self {
        let initial_delay = Duration::from_millis(config.capacity_retry_initial_delay_ms);
        Self {
            timeout: config.timeout(),
            capacity_retry: RetryPolicy::builder()
                .max_attempts(config.capacity_retry_max_attempts)
                .initial_delay(initial_delay)
                .max_elapsed(Duration::from_millis(config.capacity_retry_budget_ms))
                .jitter(true)
                .build(),
            payment_retry: RetryPolicy::builder()
                .max_attempts(config.payment_retry_max_attempts)
                .initial_delay(initial_delay)
                .jitter(true)
                .build(),
            payment_call_timeout: config.payment_call_timeout(),
            repository_retry: RetryPolicy::builder()
                .max_attempts(3)
                .initial_delay(Duration::from_millis(100))
                .build(),
            compensation_retry: RetryPolicy::builder()
                .initial_delay(initial_delay)
                .max_delay(Duration::from_millis(config.compensation_max_delay_ms))
                .jitter(true)
                .build(),
            compensation_alert_after: config.compensation_alert_after,
        }
    }
}

impl Default for SagaSettings {
    fn default() -> Self {
        Self::from(&crate::config::Config::default().saga)
    }
}

/// Environment of the saga reducer.
#[derive(Clone)]
pub struct SagaEnvironment {
    /// Seat counter authority
    pub capacity: Arc<dyn CapacityStore>,
    /// Booking rows and history
    pub repository: Arc<dyn BookingRepository>,
    /// Outbound payments
    pub payments: Arc<dyn PaymentGateway>,
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Retry and timeout knobs
    pub settings: Arc<SagaSettings>,
}

impl SagaEnvironment {
    /// Bundle the saga's dependencies.
    #[must_use]
    pub fn new(
        capacity: Arc<dyn CapacityStore>,
        repository: Arc<dyn BookingRepository>,
        payments: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        settings: SagaSettings,
    ) -> Self {
        Self {
            capacity,
            repository,
            payments,
            clock,
            settings: Arc::new(settings),
        }
    }
}
