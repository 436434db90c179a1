use super::{from_db_count, is_unique_violation, to_db_count};
use crate::error::RepositoryError;
use crate::repository::{BookingRepository, BookingUpdate, HistoryAction, HistoryEntry, RepositoryFuture};
use crate::types::{
    Booking, BookingId, BookingNumber, BookingStatus, FailureReason, Money, ReservationId, TimeSlotId, UserId,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

const BOOKING_COLUMNS: &str = "id, booking_number, user_id, time_slot_id, player_count, status, amount, \
     slot_starts_at, reservation_id, saga_deadline, failure_reason, refund_amount, cancelled_at, \
     resolution_lease_until, created_at, updated_at";

const IN_FLIGHT: [&str; 2] = [BookingStatus::Pending.as_str(), BookingStatus::SagaPending.as_str()];

fn unavailable(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Unavailable(err.to_string())
}

fn corrupt(detail: impl Into<String>) -> RepositoryError {
    RepositoryError::Corrupt(detail.into())
}

fn status_from_db(value: &str) -> Result<BookingStatus, RepositoryError> {
    BookingStatus::parse(value).ok_or_else(|| corrupt(format!("unknown booking status {value}")))
}

fn booking_from_row(row: &PgRow) -> Result<Booking, RepositoryError> {
    let number: String = row.try_get("booking_number").map_err(unavailable)?;
    let status: String = row.try_get("status").map_err(unavailable)?;
    let player_count: i32 = row.try_get("player_count").map_err(unavailable)?;
    let failure_reason = row
        .try_get::<Option<serde_json::Value>, _>("failure_reason")
        .map_err(unavailable)?
        .map(serde_json::from_value::<FailureReason>)
        .transpose()
        .map_err(|e| corrupt(format!("failure_reason: {e}")))?;

    Ok(Booking {
        id: BookingId::from_uuid(row.try_get("id").map_err(unavailable)?),
        booking_number: BookingNumber::parse(&number).map_err(|e| corrupt(e.to_string()))?,
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(unavailable)?),
        time_slot_id: TimeSlotId::from_uuid(row.try_get("time_slot_id").map_err(unavailable)?),
        player_count: from_db_count(player_count).ok_or_else(|| corrupt("negative player_count"))?,
        status: status_from_db(&status)?,
        amount: Money::won(row.try_get("amount").map_err(unavailable)?),
        slot_starts_at: row.try_get("slot_starts_at").map_err(unavailable)?,
        reservation_id: row
            .try_get::<Option<uuid::Uuid>, _>("reservation_id")
            .map_err(unavailable)?
            .map(ReservationId::from_uuid),
        saga_deadline: row.try_get("saga_deadline").map_err(unavailable)?,
        failure_reason,
        refund_amount: row
            .try_get::<Option<i64>, _>("refund_amount")
            .map_err(unavailable)?
            .map(Money::won),
        cancelled_at: row.try_get("cancelled_at").map_err(unavailable)?,
        resolution_lease_until: row.try_get("resolution_lease_until").map_err(unavailable)?,
        created_at: row.try_get("created_at").map_err(unavailable)?,
        updated_at: row.try_get("updated_at").map_err(unavailable)?,
    })
}

fn history_from_row(row: &PgRow) -> Result<HistoryEntry, RepositoryError> {
    let action: String = row.try_get("action").map_err(unavailable)?;
    let from: Option<String> = row.try_get("from_status").map_err(unavailable)?;
    let to: String = row.try_get("to_status").map_err(unavailable)?;
    Ok(HistoryEntry {
        booking_id: BookingId::from_uuid(row.try_get("booking_id").map_err(unavailable)?),
        action: HistoryAction::parse(&action).ok_or_else(|| corrupt(format!("unknown history action {action}")))?,
        from: from.as_deref().map(status_from_db).transpose()?,
        to: status_from_db(&to)?,
        at: row.try_get("at").map_err(unavailable)?,
        details: row.try_get("details").map_err(unavailable)?,
    })
}

async fn append_history(tx: &mut Transaction<'_, Postgres>, entry: &HistoryEntry) -> Result<(), RepositoryError> {
    sqlx::query(
        r"
        INSERT INTO booking_history (booking_id, action, from_status, to_status, at, details)
        VALUES ($1, $2, $3, $4, $5, $6)
        ",
    )
    .bind(entry.booking_id.as_uuid())
    .bind(entry.action.as_str())
    .bind(entry.from.map(BookingStatus::as_str))
    .bind(entry.to.as_str())
    .bind(entry.at)
    .bind(entry.details.as_deref())
    .execute(&mut **tx)
    .await
    .map_err(unavailable)?;
    Ok(())
}

/// Booking repository backed by `PostgreSQL`.
///
/// A transition locks the booking row, checks the expected statuses, updates
/// the row and appends the history row in one transaction.
#[derive(Clone)]
pub struct PostgresBookingRepository {
    pool: PgPool,
}

impl PostgresBookingRepository {
    /// Wrap a pool. Run [`super::run_migrations`] first.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn select_many(
        &self,
        filter: &str,
        order_by: &str,
        now: DateTime<Utc>,
        bound: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Booking>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings \
             WHERE {filter} \
               AND (resolution_lease_until IS NULL OR resolution_lease_until <= $1) \
             ORDER BY {order_by} \
             LIMIT $3"
        ))
        .bind(now)
        .bind(bound)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.iter().map(booking_from_row).collect()
    }
}

impl BookingRepository for PostgresBookingRepository {
    fn insert(&self, booking: Booking) -> RepositoryFuture<'_, ()> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(unavailable)?;
            let failure_reason = booking
                .failure_reason
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| corrupt(e.to_string()))?;

            let result = sqlx::query(
                r"
                INSERT INTO bookings (
                    id, booking_number, user_id, time_slot_id, player_count, status, amount,
                    slot_starts_at, reservation_id, saga_deadline, failure_reason, refund_amount,
                    cancelled_at, resolution_lease_until, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                ",
            )
            .bind(booking.id.as_uuid())
            .bind(booking.booking_number.as_str())
            .bind(booking.user_id.as_uuid())
            .bind(booking.time_slot_id.as_uuid())
            .bind(to_db_count(booking.player_count))
            .bind(booking.status.as_str())
            .bind(booking.amount.amount())
            .bind(booking.slot_starts_at)
            .bind(booking.reservation_id.map(|id| *id.as_uuid()))
            .bind(booking.saga_deadline)
            .bind(failure_reason)
            .bind(booking.refund_amount.map(Money::amount))
            .bind(booking.cancelled_at)
            .bind(booking.resolution_lease_until)
            .bind(booking.created_at)
            .bind(booking.updated_at)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => {},
                Err(err) if is_unique_violation(&err) => return Err(RepositoryError::Duplicate(booking.id)),
                Err(err) => return Err(unavailable(err)),
            }

            append_history(
                &mut tx,
                &HistoryEntry {
                    booking_id: booking.id,
                    action: HistoryAction::Created,
                    from: None,
                    to: booking.status,
                    at: booking.created_at,
                    details: None,
                },
            )
            .await?;
            tx.commit().await.map_err(unavailable)?;
            Ok(())
        })
    }

    fn get(&self, booking_id: BookingId) -> RepositoryFuture<'_, Booking> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1"))
                .bind(booking_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?
                .ok_or(RepositoryError::NotFound(booking_id))?;
            booking_from_row(&row)
        })
    }

    fn get_by_number<'a>(&'a self, number: &'a BookingNumber) -> RepositoryFuture<'a, Option<Booking>> {
        Box::pin(async move {
            sqlx::query(&format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE booking_number = $1"))
                .bind(number.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?
                .as_ref()
                .map(booking_from_row)
                .transpose()
        })
    }

    fn transition<'a>(
        &'a self,
        booking_id: BookingId,
        expected: &'a [BookingStatus],
        update: BookingUpdate,
    ) -> RepositoryFuture<'a, Booking> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(unavailable)?;
            let row = sqlx::query(&format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1 FOR UPDATE"))
                .bind(booking_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(unavailable)?
                .ok_or(RepositoryError::NotFound(booking_id))?;
            let mut booking = booking_from_row(&row)?;

            if !expected.contains(&booking.status) {
                return Err(RepositoryError::Conflict {
                    booking_id,
                    current: booking.status,
                });
            }
            let from = booking.status;
            update.apply_to(&mut booking);

            let failure_reason = booking
                .failure_reason
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| corrupt(e.to_string()))?;
            sqlx::query(
                r"
                UPDATE bookings SET
                    status = $2,
                    reservation_id = $3,
                    saga_deadline = $4,
                    failure_reason = $5,
                    refund_amount = $6,
                    cancelled_at = $7,
                    resolution_lease_until = $8,
                    updated_at = $9
                WHERE id = $1
                ",
            )
            .bind(booking_id.as_uuid())
            .bind(booking.status.as_str())
            .bind(booking.reservation_id.map(|id| *id.as_uuid()))
            .bind(booking.saga_deadline)
            .bind(failure_reason)
            .bind(booking.refund_amount.map(Money::amount))
            .bind(booking.cancelled_at)
            .bind(booking.resolution_lease_until)
            .bind(booking.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

            append_history(&mut tx, &update.history_entry(booking_id, from)).await?;
            tx.commit().await.map_err(unavailable)?;
            Ok(booking)
        })
    }

    fn find_expired_sagas(&self, now: DateTime<Utc>, limit: u32) -> RepositoryFuture<'_, Vec<Booking>> {
        Box::pin(async move {
            self.select_many(
                "status = 'SAGA_PENDING' AND saga_deadline < $2",
                "created_at",
                now,
                now,
                limit,
            )
            .await
        })
    }

    fn find_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> RepositoryFuture<'_, Vec<Booking>> {
        Box::pin(async move {
            self.select_many("status = 'PENDING' AND created_at < $2", "created_at", now, created_before, limit)
                .await
        })
    }

    fn claim_resolution(
        &self,
        booking_id: BookingId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> RepositoryFuture<'_, bool> {
        Box::pin(async move {
            let claimed = sqlx::query(
                r"
                UPDATE bookings SET resolution_lease_until = $3
                WHERE id = $1
                  AND status = ANY($4)
                  AND (resolution_lease_until IS NULL OR resolution_lease_until <= $2)
                ",
            )
            .bind(booking_id.as_uuid())
            .bind(now)
            .bind(lease_until)
            .bind(&IN_FLIGHT[..])
            .execute(&self.pool)
            .await
            .map_err(unavailable)?
            .rows_affected()
                == 1;

            if !claimed {
                let exists: Option<(uuid::Uuid,)> = sqlx::query_as("SELECT id FROM bookings WHERE id = $1")
                    .bind(booking_id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(unavailable)?;
                if exists.is_none() {
                    return Err(RepositoryError::NotFound(booking_id));
                }
            }
            Ok(claimed)
        })
    }

    fn release_claim(&self, booking_id: BookingId) -> RepositoryFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(r"UPDATE bookings SET resolution_lease_until = NULL WHERE id = $1")
                .bind(booking_id.as_uuid())
                .execute(&self.pool)
                .await
                .map_err(unavailable)?;
            Ok(())
        })
    }

    fn history(&self, booking_id: BookingId) -> RepositoryFuture<'_, Vec<HistoryEntry>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT booking_id, action, from_status, to_status, at, details
                FROM booking_history
                WHERE booking_id = $1
                ORDER BY id
                ",
            )
            .bind(booking_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;
            rows.iter().map(history_from_row).collect()
        })
    }

    fn ping(&self) -> RepositoryFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("SELECT 1").execute(&self.pool).await.map_err(unavailable)?;
            Ok(())
        })
    }
}
