use super::{from_db_count, to_db_count};
use crate::error::IdempotencyError;
use crate::idempotency::{IdempotencyFuture, IdempotencyRecord, IdempotencyStore, InsertOutcome, RequestFingerprint};
use crate::types::{BookingId, IdempotencyKey, TimeSlotId, UserId};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

fn unavailable(err: impl std::fmt::Display) -> IdempotencyError {
    IdempotencyError::Unavailable(err.to_string())
}

fn record_from_row(row: &PgRow) -> Result<IdempotencyRecord, IdempotencyError> {
    let key: String = row.try_get("key").map_err(unavailable)?;
    let player_count: i32 = row.try_get("player_count").map_err(unavailable)?;
    Ok(IdempotencyRecord {
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(unavailable)?),
        key: IdempotencyKey::parse(&key).map_err(unavailable)?,
        booking_id: BookingId::from_uuid(row.try_get("booking_id").map_err(unavailable)?),
        fingerprint: RequestFingerprint {
            time_slot_id: TimeSlotId::from_uuid(row.try_get("time_slot_id").map_err(unavailable)?),
            player_count: from_db_count(player_count).ok_or_else(|| unavailable("negative player_count"))?,
        },
        created_at: row.try_get("created_at").map_err(unavailable)?,
        expires_at: row.try_get("expires_at").map_err(unavailable)?,
    })
}

/// Idempotency store backed by `PostgreSQL`.
///
/// Insert-if-absent is a single `INSERT ... ON CONFLICT DO UPDATE` that only
/// overwrites an expired row, so concurrent first attempts resolve to one winner.
#[derive(Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    /// Wrap a pool. Run [`super::run_migrations`] first.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl IdempotencyStore for PostgresIdempotencyStore {
    fn insert_if_absent(
        &self,
        record: IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> IdempotencyFuture<'_, InsertOutcome> {
        Box::pin(async move {
            let inserted = sqlx::query(
                r"
                INSERT INTO idempotency_keys (
                    user_id, key, booking_id, time_slot_id, player_count, created_at, expires_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (user_id, key) DO UPDATE SET
                    booking_id = EXCLUDED.booking_id,
                    time_slot_id = EXCLUDED.time_slot_id,
                    player_count = EXCLUDED.player_count,
                    created_at = EXCLUDED.created_at,
                    expires_at = EXCLUDED.expires_at
                WHERE idempotency_keys.expires_at <= $8
                ",
            )
            .bind(record.user_id.as_uuid())
            .bind(record.key.as_str())
            .bind(record.booking_id.as_uuid())
            .bind(record.fingerprint.time_slot_id.as_uuid())
            .bind(to_db_count(record.fingerprint.player_count))
            .bind(record.created_at)
            .bind(record.expires_at)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?
            .rows_affected()
                == 1;
            if inserted {
                return Ok(InsertOutcome::Inserted);
            }

            let row = sqlx::query(
                r"
                SELECT user_id, key, booking_id, time_slot_id, player_count, created_at, expires_at
                FROM idempotency_keys
                WHERE user_id = $1 AND key = $2
                ",
            )
            .bind(record.user_id.as_uuid())
            .bind(record.key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| unavailable("idempotency record vanished during insert"))?;
            Ok(InsertOutcome::Existing(record_from_row(&row)?))
        })
    }

    fn replace<'a>(
        &'a self,
        stale: &'a IdempotencyRecord,
        fresh: IdempotencyRecord,
    ) -> IdempotencyFuture<'a, bool> {
        Box::pin(async move {
            let replaced = sqlx::query(
                r"
                UPDATE idempotency_keys SET
                    booking_id = $4,
                    time_slot_id = $5,
                    player_count = $6,
                    created_at = $7,
                    expires_at = $8
                WHERE user_id = $1 AND key = $2 AND booking_id = $3
                ",
            )
            .bind(stale.user_id.as_uuid())
            .bind(stale.key.as_str())
            .bind(stale.booking_id.as_uuid())
            .bind(fresh.booking_id.as_uuid())
            .bind(fresh.fingerprint.time_slot_id.as_uuid())
            .bind(to_db_count(fresh.fingerprint.player_count))
            .bind(fresh.created_at)
            .bind(fresh.expires_at)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?
            .rows_affected();
            Ok(replaced == 1)
        })
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> IdempotencyFuture<'_, u64> {
        Box::pin(async move {
            let purged = sqlx::query(r"DELETE FROM idempotency_keys WHERE expires_at <= $1")
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(unavailable)?
                .rows_affected();
            if purged > 0 {
                tracing::debug!(purged, "Expired idempotency keys purged");
            }
            Ok(purged)
        })
    }
}
