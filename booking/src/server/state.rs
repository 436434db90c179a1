//! Shared state of the HTTP facade.

use crate::orchestrator::BookingService;
use std::sync::Arc;

/// Application state shared across all HTTP handlers.
///
/// Cloned per request; everything inside is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The booking service
    pub service: Arc<BookingService>,
}

impl AppState {
    /// Wrap a booking service.
    #[must_use]
    pub const fn new(service: Arc<BookingService>) -> Self {
        Self { service }
    }
}
