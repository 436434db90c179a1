//! `PostgreSQL` adapters for the capacity store, booking repository and
//! idempotency store.
//!
//! Atomicity comes from row locks: seats are taken by a conditional `UPDATE`
//! on the slot row inside a transaction, and every booking
//! transition locks the booking row, so the in-memory semantics carry over
//! unchanged to several processes sharing one database.

mod capacity;
mod idempotency;
mod repository;

pub use capacity::PostgresCapacityStore;
pub use idempotency::PostgresIdempotencyStore;
pub use repository::PostgresBookingRepository;

use crate::config::PostgresConfig;
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Schema applied by [`run_migrations`].
pub const SCHEMA: &str = include_str!("../../migrations/0001_booking_saga.sql");

/// Open a connection pool.
///
/// # Errors
///
/// Returns the driver error when no connection can be made.
pub async fn connect(url: &str, config: &PostgresConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.connect_timeout())
        .connect(url)
        .await?;
    tracing::info!(max_connections = config.max_connections, "Connected to PostgreSQL");
    Ok(pool)
}

/// Create the booking tables if they do not exist.
///
/// # Errors
///
/// Returns the driver error when a statement fails.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    tracing::info!("Booking schema ready");
    Ok(())
}

/// Counts are `INTEGER` columns.
fn to_db_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_db_count(value: i32) -> Option<u32> {
    u32::try_from(value).ok()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
