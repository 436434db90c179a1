//! Dependency injection traits shared by every environment.

use chrono::{DateTime, Utc};

/// Clock trait - abstracts time operations for testability
///
/// Reducers and background jobs read time only through a `Clock`, so saga
/// deadlines and refund windows can be tested with a fixed or manually
/// advanced clock.
pub trait Clock: Send + Sync {
    /// Get the current time
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}
