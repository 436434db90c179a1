//! # Teetime Core
//!
//! Core traits and types for the tee-time booking services.
//!
//! Business workflows are written as reducers: pure functions
//! `(State, Action, Environment) → (State, Effects)`. A reducer never performs
//! I/O itself; it returns [`effect::Effect`] values describing the work, and the
//! runtime executes them and feeds the resulting actions back in.
//!
//! ## Core Concepts
//!
//! - **State**: Domain state owned by one reducer instance
//! - **Action**: Every input to a reducer (commands and the events produced by effects)
//! - **Reducer**: Transition function, deterministic given its inputs
//! - **Effect**: Description of a side effect, not its execution
//! - **Environment**: Injected dependencies (clock, stores, gateways)
//!
//! ## Example
//!
//! ```
//! use teetime_core::{effect::Effect, reducer::Reducer, smallvec, SmallVec};
//!
//! #[derive(Default)]
//! struct Counter {
//!     value: u32,
//! }
//!
//! enum CounterAction {
//!     Increment,
//! }
//!
//! struct CounterReducer;
//!
//! impl Reducer for CounterReducer {
//!     type State = Counter;
//!     type Action = CounterAction;
//!     type Environment = ();
//!
//!     fn reduce(
//!         &self,
//!         state: &mut Counter,
//!         action: CounterAction,
//!         _env: &(),
//!     ) -> SmallVec<[Effect<CounterAction>; 4]> {
//!         match action {
//!             CounterAction::Increment => state.value += 1,
//!         }
//!         smallvec![Effect::None]
//!     }
//! }
//!
//! let mut state = Counter::default();
//! let _ = CounterReducer.reduce(&mut state, CounterAction::Increment, &());
//! assert_eq!(state.value, 1);
//! ```

#![forbid(unsafe_code)]

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{smallvec, SmallVec};

pub mod effect;
pub mod environment;
pub mod reducer;

/// Effects returned by a single reduce step.
///
/// Most transitions emit zero or one effect, so four inline slots avoid a heap
/// allocation on the hot path.
pub type Effects<Action> = SmallVec<[effect::Effect<Action>; 4]>;
