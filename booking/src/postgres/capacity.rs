use super::{from_db_count, is_unique_violation, to_db_count};
use crate::capacity::{
    alert_invariant_violation, check_reservable, CapacityFuture, CapacityStore, ReleaseOutcome, ReserveRequest,
};
use crate::catalog::{catalog_error, SlotCatalog};
use crate::error::{CapacityError, CatalogError};
use crate::types::{
    BookingId, CapacityReservation, GameId, Money, ReservationId, ReservationState, SlotSnapshot, SlotStatus,
    TimeSlot, TimeSlotId,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::future::Future;
use std::pin::Pin;

const SLOT_COLUMNS: &str =
    "id, game_id, starts_at, ends_at, max_players, booked_players, price_per_player, status";
const RESERVATION_COLUMNS: &str = "id, time_slot_id, booking_id, player_count, reserved_at, state";

fn unavailable(err: sqlx::Error) -> CapacityError {
    CapacityError::Unavailable(err.to_string())
}

fn corrupt(detail: impl Into<String>) -> CapacityError {
    CapacityError::InvariantViolation(detail.into())
}

fn slot_from_row(row: &PgRow) -> Result<TimeSlot, CapacityError> {
    let status: String = row.try_get("status").map_err(unavailable)?;
    let max_players: i32 = row.try_get("max_players").map_err(unavailable)?;
    let booked_players: i32 = row.try_get("booked_players").map_err(unavailable)?;
    Ok(TimeSlot {
        id: TimeSlotId::from_uuid(row.try_get("id").map_err(unavailable)?),
        game_id: GameId::from_uuid(row.try_get("game_id").map_err(unavailable)?),
        starts_at: row.try_get("starts_at").map_err(unavailable)?,
        ends_at: row.try_get("ends_at").map_err(unavailable)?,
        max_players: from_db_count(max_players).ok_or_else(|| corrupt("negative max_players"))?,
        booked_players: from_db_count(booked_players).ok_or_else(|| corrupt("negative booked_players"))?,
        price_per_player: Money::won(row.try_get("price_per_player").map_err(unavailable)?),
        status: SlotStatus::parse(&status).ok_or_else(|| corrupt(format!("unknown slot status {status}")))?,
    })
}

fn reservation_from_row(row: &PgRow) -> Result<CapacityReservation, CapacityError> {
    let state: String = row.try_get("state").map_err(unavailable)?;
    let player_count: i32 = row.try_get("player_count").map_err(unavailable)?;
    Ok(CapacityReservation {
        id: ReservationId::from_uuid(row.try_get("id").map_err(unavailable)?),
        time_slot_id: TimeSlotId::from_uuid(row.try_get("time_slot_id").map_err(unavailable)?),
        booking_id: BookingId::from_uuid(row.try_get("booking_id").map_err(unavailable)?),
        player_count: from_db_count(player_count).ok_or_else(|| corrupt("negative player_count"))?,
        reserved_at: row.try_get("reserved_at").map_err(unavailable)?,
        state: ReservationState::parse(&state)
            .ok_or_else(|| corrupt(format!("unknown reservation state {state}")))?,
    })
}

/// Capacity store backed by `PostgreSQL`.
///
/// Reserving is a single conditional `UPDATE` on the slot row; releasing locks
/// the reservation row and then the slot row. Either way the slot row lock is
/// the per-slot critical section around the counter.
#[derive(Clone)]
pub struct PostgresCapacityStore {
    pool: PgPool,
}

impl PostgresCapacityStore {
    /// Wrap a pool. Run [`super::run_migrations`] first.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_slot(
        tx: &mut Transaction<'_, Postgres>,
        time_slot_id: TimeSlotId,
    ) -> Result<TimeSlot, CapacityError> {
        let row = sqlx::query(&format!("SELECT {SLOT_COLUMNS} FROM time_slots WHERE id = $1 FOR UPDATE"))
            .bind(time_slot_id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(unavailable)?
            .ok_or(CapacityError::SlotNotFound(time_slot_id))?;
        slot_from_row(&row)
    }

    async fn save_slot(tx: &mut Transaction<'_, Postgres>, slot: &TimeSlot) -> Result<(), CapacityError> {
        sqlx::query(r"UPDATE time_slots SET booked_players = $2, status = $3 WHERE id = $1")
            .bind(slot.id.as_uuid())
            .bind(to_db_count(slot.booked_players))
            .bind(slot.status.as_str())
            .execute(&mut **tx)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn reservation_of_booking(
        tx: &mut Transaction<'_, Postgres>,
        booking_id: BookingId,
    ) -> Result<Option<CapacityReservation>, CapacityError> {
        sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM capacity_reservations WHERE booking_id = $1"
        ))
        .bind(booking_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(unavailable)?
        .as_ref()
        .map(reservation_from_row)
        .transpose()
    }

    async fn set_state(
        tx: &mut Transaction<'_, Postgres>,
        reservation_id: ReservationId,
        state: ReservationState,
    ) -> Result<(), CapacityError> {
        sqlx::query(r"UPDATE capacity_reservations SET state = $2 WHERE id = $1")
            .bind(reservation_id.as_uuid())
            .bind(state.as_str())
            .execute(&mut **tx)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    /// Lock the slot, then mark `reservation` released and give its seats back.
    async fn give_back(
        tx: &mut Transaction<'_, Postgres>,
        reservation: &CapacityReservation,
    ) -> Result<ReleaseOutcome, CapacityError> {
        let mut slot = Self::lock_slot(tx, reservation.time_slot_id).await?;
        if slot.booked_players < reservation.player_count {
            alert_invariant_violation(slot.id, "booked_players would go negative");
            slot.booked_players = 0;
        } else {
            slot.booked_players -= reservation.player_count;
        }
        slot.recompute_status();
        Self::set_state(tx, reservation.id, ReservationState::Released).await?;
        Self::save_slot(tx, &slot).await?;
        Ok(ReleaseOutcome::Released {
            player_count: reservation.player_count,
        })
    }

    /// Release the held reservation whose `column` equals `id`.
    async fn release_where(&self, column: &'static str, id: &uuid::Uuid) -> Result<ReleaseOutcome, CapacityError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let Some(row) = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM capacity_reservations WHERE {column} = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable)?
        else {
            return Ok(ReleaseOutcome::NotFound);
        };
        let reservation = reservation_from_row(&row)?;

        let outcome = match reservation.state {
            ReservationState::Released => ReleaseOutcome::AlreadyReleased,
            ReservationState::Committed => ReleaseOutcome::AlreadyCommitted,
            ReservationState::Held => Self::give_back(&mut tx, &reservation).await?,
        };
        tx.commit().await.map_err(unavailable)?;

        if outcome.freed_seats() > 0 {
            tracing::debug!(
                time_slot_id = %reservation.time_slot_id,
                reservation_id = %reservation.id,
                player_count = reservation.player_count,
                "Capacity released"
            );
        }
        Ok(outcome)
    }
}

impl CapacityStore for PostgresCapacityStore {
    fn publish(&self, slot: TimeSlot) -> CapacityFuture<'_, TimeSlot> {
        Box::pin(async move {
            let mut slot = slot;
            slot.recompute_status();
            let result = sqlx::query(
                r"
                INSERT INTO time_slots (
                    id, game_id, starts_at, ends_at, max_players, booked_players, price_per_player, status
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(slot.id.as_uuid())
            .bind(slot.game_id.as_uuid())
            .bind(slot.starts_at)
            .bind(slot.ends_at)
            .bind(to_db_count(slot.max_players))
            .bind(to_db_count(slot.booked_players))
            .bind(slot.price_per_player.amount())
            .bind(slot.status.as_str())
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => {
                    tracing::info!(time_slot_id = %slot.id, max_players = slot.max_players, "Time slot published");
                    Ok(slot)
                },
                Err(err) if is_unique_violation(&err) => Err(CapacityError::AlreadyPublished(slot.id)),
                Err(err) => Err(unavailable(err)),
            }
        })
    }

    fn slot(&self, time_slot_id: TimeSlotId) -> CapacityFuture<'_, TimeSlot> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {SLOT_COLUMNS} FROM time_slots WHERE id = $1"))
                .bind(time_slot_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?
                .ok_or(CapacityError::SlotNotFound(time_slot_id))?;
            slot_from_row(&row)
        })
    }

    fn set_status(&self, time_slot_id: TimeSlotId, status: SlotStatus) -> CapacityFuture<'_, TimeSlot> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(unavailable)?;
            let mut slot = Self::lock_slot(&mut tx, time_slot_id).await?;
            slot.status = status;
            slot.recompute_status();
            Self::save_slot(&mut tx, &slot).await?;
            tx.commit().await.map_err(unavailable)?;
            tracing::info!(time_slot_id = %time_slot_id, status = slot.status.as_str(), "Time slot status changed");
            Ok(slot)
        })
    }

    fn reserve(&self, request: ReserveRequest) -> CapacityFuture<'_, CapacityReservation> {
        Box::pin(async move {
            if request.player_count == 0 {
                return Err(CapacityError::InvalidPlayerCount(0));
            }
            let mut tx = self.pool.begin().await.map_err(unavailable)?;

            if let Some(existing) = Self::reservation_of_booking(&mut tx, request.booking_id).await? {
                return match existing.state {
                    ReservationState::Released => Err(CapacityError::ReservationGone(existing.id)),
                    ReservationState::Held | ReservationState::Committed => Ok(existing),
                };
            }

            // Check and increment in one statement; the row lock it takes
            // serializes concurrent reservations on the slot.
            let updated = sqlx::query(&format!(
                "UPDATE time_slots SET \
                     booked_players = booked_players + $2, \
                     status = CASE WHEN booked_players + $2 >= max_players \
                                   THEN 'FULLY_BOOKED' ELSE 'AVAILABLE' END \
                 WHERE id = $1 \
                   AND status IN ('AVAILABLE', 'FULLY_BOOKED') \
                   AND booked_players + $2 <= max_players \
                 RETURNING {SLOT_COLUMNS}"
            ))
            .bind(request.time_slot_id.as_uuid())
            .bind(to_db_count(request.player_count))
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable)?;

            let Some(row) = updated else {
                drop(tx);
                let slot = self.slot(request.time_slot_id).await?;
                check_reservable(&slot, request.player_count)?;
                return Err(CapacityError::CapacityExhausted {
                    requested: request.player_count,
                    available: slot.available_players(),
                });
            };
            let slot = slot_from_row(&row)?;

            let reservation = CapacityReservation {
                id: ReservationId::new(),
                time_slot_id: request.time_slot_id,
                booking_id: request.booking_id,
                player_count: request.player_count,
                reserved_at: request.requested_at,
                state: ReservationState::Held,
            };
            let inserted = sqlx::query(
                r"
                INSERT INTO capacity_reservations (id, time_slot_id, booking_id, player_count, reserved_at, state)
                VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(reservation.id.as_uuid())
            .bind(reservation.time_slot_id.as_uuid())
            .bind(reservation.booking_id.as_uuid())
            .bind(to_db_count(reservation.player_count))
            .bind(reservation.reserved_at)
            .bind(reservation.state.as_str())
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {},
                Err(err) if is_unique_violation(&err) => {
                    // A concurrent call for the same booking won; roll back our increment.
                    drop(tx);
                    return self
                        .reservation_for_booking(request.booking_id)
                        .await?
                        .ok_or_else(|| corrupt("reservation vanished after unique violation"));
                },
                Err(err) => return Err(unavailable(err)),
            }
            tx.commit().await.map_err(unavailable)?;

            tracing::debug!(
                time_slot_id = %request.time_slot_id,
                booking_id = %request.booking_id,
                player_count = request.player_count,
                booked_players = slot.booked_players,
                "Capacity reserved"
            );
            Ok(reservation)
        })
    }

    fn commit(&self, reservation_id: ReservationId) -> CapacityFuture<'_, CapacityReservation> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(unavailable)?;
            let row = sqlx::query(&format!(
                "SELECT {RESERVATION_COLUMNS} FROM capacity_reservations WHERE id = $1 FOR UPDATE"
            ))
            .bind(reservation_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable)?
            .ok_or(CapacityError::ReservationNotFound(reservation_id))?;
            let reservation = reservation_from_row(&row)?;

            match reservation.state {
                ReservationState::Committed => Ok(reservation),
                ReservationState::Released => Err(CapacityError::ReservationGone(reservation_id)),
                ReservationState::Held => {
                    Self::set_state(&mut tx, reservation_id, ReservationState::Committed).await?;
                    tx.commit().await.map_err(unavailable)?;
                    Ok(CapacityReservation {
                        state: ReservationState::Committed,
                        ..reservation
                    })
                },
            }
        })
    }

    fn release(&self, reservation_id: ReservationId) -> CapacityFuture<'_, ReleaseOutcome> {
        Box::pin(async move { self.release_where("id", reservation_id.as_uuid()).await })
    }

    fn release_for_booking(&self, booking_id: BookingId) -> CapacityFuture<'_, ReleaseOutcome> {
        Box::pin(async move { self.release_where("booking_id", booking_id.as_uuid()).await })
    }

    fn cancel_committed(&self, booking_id: BookingId) -> CapacityFuture<'_, ReleaseOutcome> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(unavailable)?;
            let Some(row) = sqlx::query(&format!(
                "SELECT {RESERVATION_COLUMNS} FROM capacity_reservations WHERE booking_id = $1 FOR UPDATE"
            ))
            .bind(booking_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable)?
            else {
                return Ok(ReleaseOutcome::NotFound);
            };
            let reservation = reservation_from_row(&row)?;

            let outcome = match reservation.state {
                ReservationState::Held => return Err(CapacityError::NotCommitted(booking_id)),
                ReservationState::Released => ReleaseOutcome::AlreadyReleased,
                ReservationState::Committed => Self::give_back(&mut tx, &reservation).await?,
            };
            tx.commit().await.map_err(unavailable)?;
            Ok(outcome)
        })
    }

    fn reservation_for_booking(
        &self,
        booking_id: BookingId,
    ) -> CapacityFuture<'_, Option<CapacityReservation>> {
        Box::pin(async move {
            sqlx::query(&format!(
                "SELECT {RESERVATION_COLUMNS} FROM capacity_reservations WHERE booking_id = $1"
            ))
            .bind(booking_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?
            .as_ref()
            .map(reservation_from_row)
            .transpose()
        })
    }

    fn ping(&self) -> CapacityFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("SELECT 1").execute(&self.pool).await.map_err(unavailable)?;
            Ok(())
        })
    }
}

impl SlotCatalog for PostgresCapacityStore {
    fn snapshot(
        &self,
        time_slot_id: TimeSlotId,
    ) -> Pin<Box<dyn Future<Output = Result<SlotSnapshot, CatalogError>> + Send + '_>> {
        Box::pin(async move {
            self.slot(time_slot_id)
                .await
                .map(|slot| slot.snapshot())
                .map_err(catalog_error)
        })
    }
}
