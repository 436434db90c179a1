//! Side effect descriptions.
//!
//! Effects are values. Reducers return them and the runtime executes them; an
//! effect that yields an action feeds it back into the same reducer.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future produced by an [`Effect::Future`].
pub type EffectFuture<Action> = Pin<Box<dyn Future<Output = Option<Action>> + Send>>;

/// Effect type - describes a side effect to be executed
///
/// # Type Parameters
///
/// - `Action`: The action type that effects can produce (feedback loop)
pub enum Effect<Action> {
    /// No-op effect
    None,

    /// Run effects concurrently
    Parallel(Vec<Effect<Action>>),

    /// Run effects one after another, each to completion
    Sequential(Vec<Effect<Action>>),

    /// Dispatch an action after a delay
    Delay {
        /// How long to wait
        duration: Duration,
        /// Action to dispatch after delay
        action: Box<Action>,
    },

    /// Arbitrary async computation
    ///
    /// If the future resolves to `Some(action)`, the action is fed back into the reducer.
    Future(EffectFuture<Action>),
}

// Manual Debug implementation since Future doesn't implement Debug
impl<Action> std::fmt::Debug for Effect<Action>
where
    Action: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "Effect::None"),
            Self::Parallel(effects) => f.debug_tuple("Effect::Parallel").field(effects).finish(),
            Self::Sequential(effects) => {
                f.debug_tuple("Effect::Sequential").field(effects).finish()
            },
            Self::Delay { duration, action } => f
                .debug_struct("Effect::Delay")
                .field("duration", duration)
                .field("action", action)
                .finish(),
            Self::Future(_) => write!(f, "Effect::Future(<future>)"),
        }
    }
}

impl<Action> Effect<Action> {
    /// Wrap an async computation whose result is fed back as an action.
    pub fn future<F>(fut: F) -> Self
    where
        F: Future<Output = Option<Action>> + Send + 'static,
    {
        Self::Future(Box::pin(fut))
    }

    /// Combine effects to run in parallel
    #[must_use]
    pub const fn merge(effects: Vec<Self>) -> Self {
        Self::Parallel(effects)
    }

    /// Chain effects to run sequentially
    #[must_use]
    pub const fn chain(effects: Vec<Self>) -> Self {
        Self::Sequential(effects)
    }

    /// Returns `true` for [`Effect::None`] and for empty composites.
    #[must_use]
    pub fn is_none(&self) -> bool {
        match self {
            Self::None => true,
            Self::Parallel(effects) | Self::Sequential(effects) => {
                effects.iter().all(Self::is_none)
            },
            Self::Delay { .. } | Self::Future(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_none_for_empty_composites() {
        assert!(Effect::<()>::None.is_none());
        assert!(Effect::<()>::merge(vec![]).is_none());
        assert!(Effect::<()>::chain(vec![Effect::None, Effect::None]).is_none());
        assert!(!Effect::future(async { Some(()) }).is_none());
    }

    #[test]
    fn test_debug_hides_future_body() {
        let effect = Effect::future(async { Some(1_u8) });
        assert_eq!(format!("{effect:?}"), "Effect::Future(<future>)");
    }

    #[tokio::test]
    async fn test_future_effect_yields_action() {
        let effect = Effect::future(async { Some(7_u8) });
        let Effect::Future(fut) = effect else {
            unreachable!("constructed as a future effect");
        };
        assert_eq!(fut.await, Some(7));
    }
}
