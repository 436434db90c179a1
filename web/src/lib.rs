//! Axum integration for the tee-time booking services.
//!
//! HTTP handlers are the imperative shell around the booking saga: they parse
//! requests, hand a command to the domain, and map the outcome to a response.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Imperative Shell (Axum)         │  ← HTTP, JSON, headers
//! ├─────────────────────────────────────────┤
//! │         Functional Core                 │
//! │  - Saga reducer                         │  ← No I/O
//! │  - Effect descriptions (values)         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! This crate holds the pieces every service needs regardless of domain:
//!
//! - [`AppError`]: status, stable code and user-facing message, rendered as JSON
//! - [`middleware::correlation_id_layer`]: `X-Correlation-ID` propagation
//! - [`extractors`]: correlation id, `Idempotency-Key` and caller identity
//! - [`handlers::health`]: liveness and readiness endpoints

#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;

// Re-export key types for convenience
pub use error::AppError;
pub use extractors::{CorrelationId, IdempotencyKeyHeader, UserIdHeader};
pub use middleware::{correlation_id_layer, CorrelationIdExt, CORRELATION_ID_HEADER};

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
