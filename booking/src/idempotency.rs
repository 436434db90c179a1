//! Idempotency guard for booking starts.
//!
//! A key is claimed with a single atomic insert-if-absent, scoped per user.
//! The winner starts the saga; everyone else is pointed at the winner's
//! booking, in flight or finished. Keys expire after a TTL and are purged by
//! the watchdog sweep.

use crate::error::{BookingError, IdempotencyError, RepositoryError};
use crate::repository::BookingRepository;
use crate::types::{BookingId, BookingStatus, IdempotencyKey, TimeSlotId, UserId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

/// Boxed future returned by idempotency store operations.
pub type IdempotencyFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, IdempotencyError>> + Send + 'a>>;

/// What a key was first used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestFingerprint {
    /// Slot requested
    pub time_slot_id: TimeSlotId,
    /// Seats requested
    pub player_count: u32,
}

/// A claimed key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Key owner
    pub user_id: UserId,
    /// The key
    pub key: IdempotencyKey,
    /// Booking started under the key
    pub booking_id: BookingId,
    /// Request the key was first used for
    pub fingerprint: RequestFingerprint,
    /// Claim time
    pub created_at: DateTime<Utc>,
    /// The key may be reused after this
    pub expires_at: DateTime<Utc>,
}

/// Result of an insert-if-absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The key was free (or expired) and is now ours
    Inserted,
    /// A live record already holds the key
    Existing(IdempotencyRecord),
}

/// Storage with an atomic insert-if-absent keyed by `(user_id, key)`.
pub trait IdempotencyStore: Send + Sync {
    /// Insert `record` unless a live record holds its key.
    ///
    /// # Errors
    ///
    /// [`IdempotencyError::Unavailable`] when the store is down.
    fn insert_if_absent(
        &self,
        record: IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> IdempotencyFuture<'_, InsertOutcome>;

    /// Replace `stale` with `fresh` only if the key still points at the same booking.
    ///
    /// # Errors
    ///
    /// [`IdempotencyError::Unavailable`] when the store is down.
    fn replace<'a>(
        &'a self,
        stale: &'a IdempotencyRecord,
        fresh: IdempotencyRecord,
    ) -> IdempotencyFuture<'a, bool>;

    /// Delete every record expired at `now`. Returns how many went.
    ///
    /// # Errors
    ///
    /// [`IdempotencyError::Unavailable`] when the store is down.
    fn purge_expired(&self, now: DateTime<Utc>) -> IdempotencyFuture<'_, u64>;
}

/// Idempotency store held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<(UserId, IdempotencyKey), IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn insert_if_absent(
        &self,
        record: IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> IdempotencyFuture<'_, InsertOutcome> {
        Box::pin(async move {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            let slot_key = (record.user_id, record.key.clone());
            match records.get(&slot_key) {
                Some(existing) if existing.expires_at > now => {
                    Ok(InsertOutcome::Existing(existing.clone()))
                },
                _ => {
                    records.insert(slot_key, record);
                    Ok(InsertOutcome::Inserted)
                },
            }
        })
    }

    fn replace<'a>(
        &'a self,
        stale: &'a IdempotencyRecord,
        fresh: IdempotencyRecord,
    ) -> IdempotencyFuture<'a, bool> {
        Box::pin(async move {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            let slot_key = (stale.user_id, stale.key.clone());
            match records.get(&slot_key) {
                Some(current) if current.booking_id == stale.booking_id => {
                    records.insert(slot_key, fresh);
                    Ok(true)
                },
                _ => Ok(false),
            }
        })
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> IdempotencyFuture<'_, u64> {
        Box::pin(async move {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            let before = records.len();
            records.retain(|_, record| record.expires_at > now);
            Ok(u64::try_from(before - records.len()).unwrap_or(u64::MAX))
        })
    }
}

/// What the guard decided for a booking start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardDecision {
    /// New attempt; start a saga for the candidate booking id
    FirstSeen,
    /// An earlier attempt is still running
    AlreadyInFlight(BookingId),
    /// An earlier attempt already finished
    AlreadyTerminal {
        /// The earlier booking
        booking_id: BookingId,
        /// Its final status
        status: BookingStatus,
    },
}

/// Deduplicates booking starts by idempotency key.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    repository: Arc<dyn BookingRepository>,
    ttl: Duration,
    orphan_after: Duration,
}

impl IdempotencyGuard {
    /// Create a guard.
    ///
    /// A key whose booking row never appeared within `orphan_after` (the
    /// claiming process died in between) is handed to the next caller.
    #[must_use]
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        repository: Arc<dyn BookingRepository>,
        ttl: Duration,
        orphan_after: Duration,
    ) -> Self {
        Self {
            store,
            repository,
            ttl,
            orphan_after,
        }
    }

    /// Claim `key` for `candidate`, or report who already holds it.
    ///
    /// # Errors
    ///
    /// [`IdempotencyError::KeyReuse`] when the key belongs to a different
    /// request; store and repository failures otherwise.
    #[tracing::instrument(skip(self, key), fields(key = %key))]
    pub async fn check_or_reserve(
        &self,
        user_id: UserId,
        key: &IdempotencyKey,
        fingerprint: RequestFingerprint,
        candidate: BookingId,
        now: DateTime<Utc>,
    ) -> Result<GuardDecision, BookingError> {
        let record = IdempotencyRecord {
            user_id,
            key: key.clone(),
            booking_id: candidate,
            fingerprint,
            created_at: now,
            expires_at: now + self.ttl,
        };

        let existing = match self.store.insert_if_absent(record.clone(), now).await? {
            InsertOutcome::Inserted => return Ok(GuardDecision::FirstSeen),
            InsertOutcome::Existing(existing) => existing,
        };

        if existing.fingerprint != fingerprint {
            return Err(IdempotencyError::KeyReuse {
                key: key.to_string(),
                booking_id: existing.booking_id,
            }
            .into());
        }

        match self.repository.get(existing.booking_id).await {
            Ok(booking) if booking.status.is_terminal() => Ok(GuardDecision::AlreadyTerminal {
                booking_id: booking.id,
                status: booking.status,
            }),
            Ok(booking) => Ok(GuardDecision::AlreadyInFlight(booking.id)),
            Err(RepositoryError::NotFound(_)) if now - existing.created_at > self.orphan_after => {
                if self.store.replace(&existing, record).await? {
                    tracing::warn!(
                        orphaned_booking_id = %existing.booking_id,
                        "Idempotency key had no booking, reassigned"
                    );
                    Ok(GuardDecision::FirstSeen)
                } else {
                    Ok(GuardDecision::AlreadyInFlight(existing.booking_id))
                }
            },
            // The winner has claimed the key but not inserted its row yet.
            Err(RepositoryError::NotFound(_)) => Ok(GuardDecision::AlreadyInFlight(existing.booking_id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Purge expired keys.
    ///
    /// # Errors
    ///
    /// [`IdempotencyError::Unavailable`] when the store is down.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, IdempotencyError> {
        self.store.purge_expired(now).await
    }
}
