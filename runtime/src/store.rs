//! The Store: owns state, runs the reducer and executes effects.

use crate::error::StoreError;
use crate::metrics::StoreMetrics;
use crate::HealthCheck;
use futures::future::{join_all, BoxFuture};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use teetime_core::{effect::Effect, reducer::Reducer};
use tokio::sync::{broadcast, Notify, RwLock};

/// The Store - runtime for a reducer
///
/// Holds the state behind a lock, serializes reduce steps, and executes the
/// returned effects on spawned tasks. Actions produced by effects are fed back
/// into the reducer and then broadcast to observers.
///
/// # Type Parameters
///
/// - `S`: State type
/// - `A`: Action type
/// - `E`: Environment type
/// - `R`: Reducer type
///
/// Cloning a store is cheap and every clone drives the same state.
pub struct Store<S, A, E, R>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    inner: Arc<Inner<S, A, E, R>>,
}

struct Inner<S, A, E, R> {
    state: RwLock<S>,
    reducer: R,
    environment: E,
    shutdown: AtomicBool,
    pending_effects: AtomicUsize,
    idle: Notify,
    /// Actions produced by effects, after the reducer has seen them.
    action_broadcast: broadcast::Sender<A>,
}

impl<S, A, E, R> Clone for Store<S, A, E, R>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Decrements the pending-effect counter on drop, panics included.
struct PendingGuard<S, A, E, R>(Arc<Inner<S, A, E, R>>);

impl<S, A, E, R> Drop for PendingGuard<S, A, E, R> {
    fn drop(&mut self) {
        let previous = self.0.pending_effects.fetch_sub(1, Ordering::AcqRel);
        StoreMetrics::record_pending(previous.saturating_sub(1));
        if previous == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl<S, A, E, R> Store<S, A, E, R>
where
    R: Reducer<State = S, Action = A, Environment = E> + Send + Sync + 'static,
    A: Send + Sync + Clone + 'static,
    S: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Create a new store with initial state, reducer, and environment
    ///
    /// The action broadcast holds 16 actions; use
    /// [`Store::with_broadcast_capacity`] for chattier reducers.
    #[must_use]
    pub fn new(initial_state: S, reducer: R, environment: E) -> Self {
        Self::with_broadcast_capacity(initial_state, reducer, environment, 16)
    }

    /// Create a store with a custom action broadcast capacity.
    #[must_use]
    pub fn with_broadcast_capacity(
        initial_state: S,
        reducer: R,
        environment: E,
        capacity: usize,
    ) -> Self {
        let (action_broadcast, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(initial_state),
                reducer,
                environment,
                shutdown: AtomicBool::new(false),
                pending_effects: AtomicUsize::new(0),
                idle: Notify::new(),
                action_broadcast,
            }),
        }
    }

    /// Send an action to the store
    ///
    /// Runs the reducer under the write lock, then starts the returned effects.
    /// Returns once the effects are started, not when they finish.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownInProgress`] if the store is shutting down.
    pub async fn send(&self, action: A) -> Result<(), StoreError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            tracing::warn!("Rejecting action, store is shutting down");
            return Err(StoreError::ShutdownInProgress);
        }
        self.dispatch(action).await;
        Ok(())
    }

    /// Send an action and wait for a matching result action
    ///
    /// Subscribes before sending so a fast effect cannot slip past the waiter.
    /// Only actions produced by effects are observed, never `action` itself.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Timeout`]: no matching action within `timeout`
    /// - [`StoreError::ChannelClosed`]: the broadcast channel closed
    /// - [`StoreError::ShutdownInProgress`]: the store is shutting down
    pub async fn send_and_wait_for<F>(
        &self,
        action: A,
        predicate: F,
        timeout: Duration,
    ) -> Result<A, StoreError>
    where
        F: Fn(&A) -> bool,
    {
        let mut rx = self.inner.action_broadcast.subscribe();

        self.send(action).await?;

        tokio::time::timeout(timeout, async {
            loop {
                match rx.recv().await {
                    Ok(action) if predicate(&action) => return Ok(action),
                    Ok(_) => {},
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Action observer lagged");
                    },
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(StoreError::ChannelClosed);
                    },
                }
            }
        })
        .await
        .map_err(|_| StoreError::Timeout)?
    }

    /// Send an action and wait until the state satisfies `predicate`.
    ///
    /// The predicate is checked right after the initial reduce and again after
    /// every action fed back by an effect.
    ///
    /// # Errors
    ///
    /// Same as [`Store::send_and_wait_for`].
    pub async fn send_and_wait_for_state<F>(
        &self,
        action: A,
        predicate: F,
        timeout: Duration,
    ) -> Result<(), StoreError>
    where
        F: Fn(&S) -> bool,
    {
        let mut rx = self.inner.action_broadcast.subscribe();

        self.send(action).await?;

        tokio::time::timeout(timeout, async {
            loop {
                if self.state(&predicate).await {
                    return Ok(());
                }
                match rx.recv().await {
                    Ok(_) => {},
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "State observer lagged");
                    },
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(StoreError::ChannelClosed);
                    },
                }
            }
        })
        .await
        .map_err(|_| StoreError::Timeout)?
    }

    /// Subscribe to all actions produced by effects.
    #[must_use]
    pub fn subscribe_actions(&self) -> broadcast::Receiver<A> {
        self.inner.action_broadcast.subscribe()
    }

    /// Read current state via a closure
    ///
    /// ```ignore
    /// let phase = store.state(|s| s.phase).await;
    /// ```
    pub async fn state<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&S) -> T,
    {
        let state = self.inner.state.read().await;
        f(&state)
    }

    /// Number of effects currently running.
    #[must_use]
    pub fn pending_effects(&self) -> usize {
        self.inner.pending_effects.load(Ordering::Acquire)
    }

    /// Wait until no effects are running.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Timeout`] if effects are still running after `timeout`.
    pub async fn settle(&self, timeout: Duration) -> Result<(), StoreError> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.inner.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.pending_effects() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .map_err(|_| StoreError::Timeout)
    }

    /// Initiate graceful shutdown of the store
    ///
    /// New external actions are rejected; effects already running finish and
    /// may still feed actions back.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownTimeout`] if effects are still running
    /// after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
        tracing::info!("Initiating graceful shutdown");
        self.inner.shutdown.store(true, Ordering::Release);

        match self.settle(timeout).await {
            Ok(()) => {
                tracing::info!("All effects completed, shutdown successful");
                Ok(())
            },
            Err(_) => {
                let pending = self.pending_effects();
                tracing::error!(pending_effects = pending, "Shutdown timed out");
                Err(StoreError::ShutdownTimeout(pending))
            },
        }
    }

    /// Perform a health check on the Store
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        let pending = self.pending_effects();
        let check = if self.inner.shutdown.load(Ordering::Acquire) {
            HealthCheck::unhealthy("store", "Store is shutting down")
        } else {
            HealthCheck::healthy("store")
        };
        check.with_metadata("pending_effects", pending.to_string())
    }

    async fn dispatch(&self, action: A) {
        let started = Instant::now();
        let effects = {
            let mut state = self.inner.state.write().await;
            self.inner
                .reducer
                .reduce(&mut state, action, &self.inner.environment)
        };
        StoreMetrics::record_action(started.elapsed());

        for effect in effects {
            self.spawn_effect(effect);
        }
    }

    fn spawn_effect(&self, effect: Effect<A>) {
        if effect.is_none() {
            StoreMetrics::record_effect("none");
            return;
        }

        let previous = self.inner.pending_effects.fetch_add(1, Ordering::AcqRel);
        StoreMetrics::record_pending(previous + 1);
        let guard = PendingGuard(Arc::clone(&self.inner));
        let store = self.clone();

        tokio::spawn(async move {
            let _guard = guard;
            store.run_effect(effect).await;
        });
    }

    /// Feed an effect-produced action back, then let observers see it.
    async fn feed_back(&self, action: A) {
        self.dispatch(action.clone()).await;
        let _ = self.inner.action_broadcast.send(action);
    }

    fn run_effect(&self, effect: Effect<A>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match effect {
                Effect::None => StoreMetrics::record_effect("none"),
                Effect::Future(fut) => {
                    StoreMetrics::record_effect("future");
                    if let Some(action) = fut.await {
                        self.feed_back(action).await;
                    }
                },
                Effect::Delay { duration, action } => {
                    StoreMetrics::record_effect("delay");
                    tokio::time::sleep(duration).await;
                    self.feed_back(*action).await;
                },
                Effect::Parallel(effects) => {
                    StoreMetrics::record_effect("parallel");
                    join_all(effects.into_iter().map(|effect| self.run_effect(effect))).await;
                },
                Effect::Sequential(effects) => {
                    StoreMetrics::record_effect("sequential");
                    for effect in effects {
                        self.run_effect(effect).await;
                    }
                },
            }
        })
    }
}
