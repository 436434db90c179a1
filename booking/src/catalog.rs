//! Read-only slot metadata from the scheduling domain.
//!
//! A saga fetches a [`SlotSnapshot`] once at start and keeps it for its whole
//! life. Capacity in a snapshot is informational only; the capacity store is
//! the authority on seats.

use crate::capacity::{CapacityStore, InMemoryCapacityStore};
use crate::error::{CapacityError, CatalogError};
use crate::types::{SlotSnapshot, TimeSlotId};
use std::future::Future;
use std::pin::Pin;

/// Source of slot metadata.
pub trait SlotCatalog: Send + Sync {
    /// Fetch metadata for one slot.
    ///
    /// # Errors
    ///
    /// [`CatalogError::SlotNotFound`] for an unknown slot,
    /// [`CatalogError::Unavailable`] when the catalog cannot be reached.
    fn snapshot(
        &self,
        time_slot_id: TimeSlotId,
    ) -> Pin<Box<dyn Future<Output = Result<SlotSnapshot, CatalogError>> + Send + '_>>;
}

pub(crate) fn catalog_error(err: CapacityError) -> CatalogError {
    match err {
        CapacityError::SlotNotFound(id) => CatalogError::SlotNotFound(id),
        other => CatalogError::Unavailable(other.to_string()),
    }
}

impl SlotCatalog for InMemoryCapacityStore {
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

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{GameId, Money, TimeSlot};
    use chrono::Utc;

    #[tokio::test]
    async fn test_snapshot_from_capacity_store() {
        let store = InMemoryCapacityStore::new();
        let now = Utc::now();
        let slot = TimeSlot::new(GameId::new(), now, now, 4, Money::won(70_000));
        let id = slot.id;
        store.publish(slot).await.unwrap();

        let snapshot = store.snapshot(id).await.unwrap();
        assert_eq!(snapshot.max_players, 4);
        assert_eq!(snapshot.price_per_player, Money::won(70_000));

        let missing = store.snapshot(TimeSlotId::new()).await;
        assert!(matches!(missing, Err(CatalogError::SlotNotFound(_))));
    }
}
