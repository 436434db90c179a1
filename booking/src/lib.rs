//! # Teetime Booking
//!
//! Tee-time booking as a saga: reserve seats, charge the card, confirm, and
//! compensate in reverse when a step fails.
//!
//! # Architecture
//!
//! ```text
//!                 ┌─────────────────────┐
//!   HTTP ────────▶│   BookingService    │◀──────── Watchdog (sweeps)
//!                 └─────────┬───────────┘                │
//!                           │ one Store per saga         │ Recover
//!                           ▼                            ▼
//!                 ┌─────────────────────┐      ┌─────────────────┐
//!                 │ saga reducer/effects│◀─────│  charge_status  │
//!                 └─────────┬───────────┘      └─────────────────┘
//!        ┌──────────────────┼──────────────────┬────────────────┐
//!        ▼                  ▼                  ▼                ▼
//!  CapacityStore   BookingRepository   PaymentGateway   IdempotencyStore
//! ```
//!
//! # Guarantees
//!
//! - **No overbooking**: seats are only taken by a conditional increment inside
//!   the capacity store.
//! - **Exactly one saga per idempotency key**: retries replay the first attempt.
//! - **Every saga ends**: in `CONFIRMED` or `SAGA_FAILED`, driven by the saga
//!   itself or by the watchdog after its deadline.
//! - **Compensation never gives up**: releases and refunds retry with capped
//!   backoff and raise an alert after repeated failures.
//!
//! # Stores
//!
//! Every port has an in-memory implementation (used by tests and by the binary
//! when `DATABASE_URL` is unset) and a `PostgreSQL` one in [`postgres`].

#![forbid(unsafe_code)]

pub mod capacity;
pub mod catalog;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod metrics;
pub mod orchestrator;
pub mod payment;
pub mod policy;
pub mod postgres;
pub mod repository;
pub mod saga;
pub mod server;
pub mod types;
pub mod watchdog;

pub use config::Config;
pub use error::{BookingError, BookingResult};
pub use orchestrator::{BookingService, StartBookingRequest, StartBookingResponse, Stores};
pub use watchdog::{Watchdog, WatchdogSettings};
