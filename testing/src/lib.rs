//! # Teetime Testing
//!
//! Testing utilities for reducers and stores.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - [`ReducerTest`], a Given-When-Then harness for reducers
//! - [`helpers::run_effects`], which executes effects inline and collects the
//!   actions they produce, so a reducer can be driven step by step without a
//!   store
//!
//! ## Example
//!
//! ```ignore
//! use teetime_testing::{helpers::run_effects, test_clock};
//!
//! #[tokio::test]
//! async fn test_saga_step() {
//!     let env = test_environment(test_clock());
//!     let mut state = SagaState::default();
//!     let effects = BookingSagaReducer.reduce(&mut state, start_action(), &env);
//!     let next = run_effects(effects).await;
//!     assert!(matches!(next[0], SagaAction::CapacityReserved { .. }));
//! }
//! ```

use chrono::{DateTime, Utc};
use teetime_core::environment::Clock;


pub use reducer_test::{assertions, ReducerTest};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use teetime_testing::mocks::FixedClock;
    /// use teetime_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hand one clone to the code
    /// under test and advance another.
    ///
    /// ```
    /// use teetime_testing::mocks::ManualClock;
    /// use teetime_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let start = Utc::now();
    /// let clock = ManualClock::new(start);
    /// clock.advance(Duration::seconds(90));
    /// assert_eq!(clock.now(), start + Duration::seconds(90));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a manual clock starting at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward (or backward, for a negative duration).
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute time.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Default test instant: 2025-01-01 00:00:00 UTC.
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_instant() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc)
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_instant())
    }

    /// Create a manual clock starting at 2025-01-01 00:00:00 UTC
    #[must_use]
    pub fn manual_clock() -> ManualClock {
        ManualClock::new(test_instant())
    }
}

/// Test helpers and utilities
pub mod helpers {
    use futures::future::BoxFuture;
    use teetime_core::effect::Effect;

    /// Execute effects inline and collect the actions they produce.
    ///
    /// Delays are skipped rather than slept, and produced actions are returned
    /// instead of being fed back. Parallel children run concurrently and their
    /// actions are returned in declaration order.
    pub async fn run_effects<A, I>(effects: I) -> Vec<A>
    where
        A: Send + 'static,
        I: IntoIterator<Item = Effect<A>>,
    {
        let mut actions = Vec::new();
        for effect in effects {
            actions.extend(run_effect(effect).await);
        }
        actions
    }

    fn run_effect<A: Send + 'static>(effect: Effect<A>) -> BoxFuture<'static, Vec<A>> {
        Box::pin(async move {
            match effect {
                Effect::None => Vec::new(),
                Effect::Future(fut) => fut.await.into_iter().collect(),
                Effect::Delay { action, .. } => vec![*action],
                Effect::Parallel(effects) => {
                    futures::future::join_all(effects.into_iter().map(run_effect))
                        .await
                        .into_iter()
                        .flatten()
                        .collect()
                },
                Effect::Sequential(effects) => {
                    let mut actions = Vec::new();
                    for effect in effects {
                        actions.extend(run_effect(effect).await);
                    }
                    actions
                },
            }
        })
    }
}

/// Initialise a test tracing subscriber once; honours `RUST_LOG`.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{manual_clock, test_clock, test_instant, FixedClock, ManualClock};

#[cfg(test)]
mod tests {
    use super::*;
    use teetime_core::effect::Effect;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = manual_clock();
        let handle = clock.clone();
        handle.advance(chrono::Duration::minutes(5));
        assert_eq!(clock.now(), test_instant() + chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn test_run_effects_collects_nested_actions() {
        let effects = vec![
            Effect::None,
            Effect::chain(vec![
                Effect::future(async { Some(1) }),
                Effect::Delay {
                    duration: std::time::Duration::from_secs(3600),
                    action: Box::new(2),
                },
            ]),
            Effect::merge(vec![Effect::future(async { None }), Effect::future(async { Some(3) })]),
        ];
        assert_eq!(helpers::run_effects(effects).await, vec![1, 2, 3]);
    }
}
