//! The [`Reducer`] trait: where business transitions live.

use crate::Effects;

/// Core abstraction for business logic.
///
/// A reducer validates an action against the current state, mutates the state in
/// place and returns descriptions of the side effects to run next. Given the same
/// state, action and environment it must always produce the same result; anything
/// non-deterministic (time, ids) comes from the environment.
///
/// # Type Parameters
///
/// - `State`: The domain state this reducer operates on
/// - `Action`: The action type this reducer processes
/// - `Environment`: The injected dependencies this reducer needs
pub trait Reducer {
    /// The state type this reducer operates on
    type State;

    /// The action type this reducer processes
    type Action;

    /// The environment type with injected dependencies
    type Environment;

    /// Reduce an action into state changes and effects.
    ///
    /// Actions that are not valid for the current state must be ignored (return
    /// no effects) rather than panic, so that re-delivered actions are harmless.
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> Effects<Self::Action>;
}
