//! The booking saga: reserve capacity, charge, then confirm or compensate.
//!
//! The saga is a reducer hosted by a [`teetime_runtime::Store`], one store per
//! booking attempt. Its durable checkpoint is the booking row; the in-memory
//! [`SagaState`] only lives as long as the run.

mod action;
mod environment;
mod reducer;
mod state;

pub use action::{RecoveryOutcome, SagaAction};
pub use environment::{SagaEnvironment, SagaSettings};
pub use reducer::BookingSagaReducer;
pub use state::{SagaContext, SagaPhase, SagaState};

use teetime_runtime::Store;

/// Store hosting one saga run.
pub type SagaStore = Store<SagaState, SagaAction, SagaEnvironment, BookingSagaReducer>;

/// Start a fresh saga store.
#[must_use]
pub fn saga_store(env: SagaEnvironment) -> SagaStore {
    Store::new(SagaState::default(), BookingSagaReducer::new(), env)
}
