//! Retry logic with exponential backoff for handling transient failures.
//!
//! Three flavours are provided:
//!
//! - [`retry_with_backoff`]: retry every error until the policy is exhausted
//! - [`retry_with_predicate`]: retry only errors the caller classifies as transient
//! - [`retry_until_success`]: never give up; raise an alert once failures pass a
//!   threshold. Used for compensating actions, where giving up would leak
//!   resources.
//!
//! A policy is bounded by attempts and, optionally, by a total time budget. The
//! budget is checked before each sleep so the whole call never overruns it.
//!
//! # Example
//!
//! ```rust
//! use teetime_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_elapsed(Duration::from_secs(5))
//!     .build();
//!
//! let result = retry_with_backoff(&policy, "reserve_capacity", || async {
//!     Ok::<_, String>(42)
//! }).await?;
//! assert_eq!(result, 42);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 3 (initial call included)
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0
/// - `max_elapsed`: none
/// - `jitter`: off
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first call
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap for a single backoff delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Total time budget across all attempts and sleeps
    pub max_elapsed: Option<Duration>,
    /// Scale each delay by a random factor in `[0.5, 1.0]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_elapsed: None,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// Calculate delay before retry number `attempt` (0-indexed).
    ///
    /// `delay = min(initial_delay * multiplier^attempt, max_delay)`, optionally
    /// scaled by jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_possible_wrap)] // attempts stay far below i32::MAX
        let base_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped_secs = base_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            use rand::Rng;
            capped_secs * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }

    /// Whether another attempt is allowed after `attempts_made` calls that took
    /// `elapsed` so far and would now sleep for `next_delay`.
    #[must_use]
    pub fn allows_another(&self, attempts_made: u32, elapsed: Duration, next_delay: Duration) -> bool {
        if attempts_made >= self.max_attempts {
            return false;
        }
        self.max_elapsed
            .is_none_or(|budget| elapsed + next_delay <= budget)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Set maximum number of attempts (initial call included, minimum 1).
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.policy.max_attempts = max_attempts.max(1);
        self
    }

    /// Set delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Bound the total time spent across attempts.
    #[must_use]
    pub const fn max_elapsed(mut self, budget: Duration) -> Self {
        self.policy.max_elapsed = Some(budget);
        self
    }

    /// Enable random jitter on each delay.
    #[must_use]
    pub const fn jitter(mut self, enabled: bool) -> Self {
        self.policy.jitter = enabled;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Retry an async operation with exponential backoff.
///
/// Returns the first success, or the last error once attempts or the time
/// budget are exhausted.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_predicate(policy, operation_name, operation, |_| true).await
}

/// Retry an async operation, but only for errors accepted by `is_retryable`.
///
/// Non-retryable errors are returned immediately without sleeping.
///
/// # Errors
///
/// Returns the first non-retryable error, or the error of the final attempt.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(
                        operation = operation_name,
                        attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            },
            Err(err) => {
                attempt += 1;

                if !is_retryable(&err) {
                    tracing::debug!(
                        operation = operation_name,
                        error = %err,
                        "Error is not retryable, failing immediately"
                    );
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                if !policy.allows_another(attempt, started.elapsed(), delay) {
                    tracing::error!(
                        operation = operation_name,
                        attempts = attempt,
                        elapsed_ms = started.elapsed().as_millis(),
                        error = %err,
                        "Operation failed after exhausting retries"
                    );
                    return Err(err);
                }

                metrics::counter!("retry_attempts_total", "operation" => operation_name.to_string())
                    .increment(1);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
            },
        }
    }
}

/// Retry an async operation until it succeeds.
///
/// Delays grow exponentially up to `policy.max_delay` and the attempt limit and
/// time budget of the policy are ignored. Once `alert_after` consecutive
/// failures have happened, every further failure is reported through
/// `on_alert` (and logged at error level with `alert = true`).
pub async fn retry_until_success<F, Fut, T, E, A>(
    policy: &RetryPolicy,
    operation_name: &str,
    alert_after: u32,
    mut operation: F,
    mut on_alert: A,
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    A: FnMut(u32, &E),
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(
                        operation = operation_name,
                        attempt,
                        "Operation succeeded after retry"
                    );
                }
                return result;
            },
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let delay = policy.delay_for_attempt(attempt - 1);

                if attempt >= alert_after {
                    tracing::error!(
                        alert = true,
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Operation keeps failing, still retrying"
                    );
                    on_alert(attempt, &err);
                } else {
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Operation failed, retrying"
                    );
                }

                metrics::counter!("retry_attempts_total", "operation" => operation_name.to_string())
                    .increment(1);
                sleep(delay).await;
            },
        }
    }
}
