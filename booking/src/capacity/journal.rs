//! Write-ahead journal for the in-memory capacity store.
//!
//! One JSON object per line. An entry is appended and synced to disk before it
//! is applied in memory, so after a crash the replayed ledger contains every
//! mutation any caller was told about. A torn final line (crash mid-write) is
//! skipped on replay; a bad line anywhere else fails the open.

use crate::error::CapacityError;
use crate::types::{CapacityReservation, ReservationId, SlotStatus, TimeSlot, TimeSlotId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// One ledger mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalEntry {
    /// A slot was published
    SlotPublished {
        /// The slot as published
        slot: TimeSlot,
    },
    /// A slot's status was set
    StatusChanged {
        /// Slot id
        time_slot_id: TimeSlotId,
        /// Requested status
        status: SlotStatus,
    },
    /// Seats were held
    Reserved {
        /// The new reservation
        reservation: CapacityReservation,
    },
    /// A held reservation became permanent
    Committed {
        /// Slot id
        time_slot_id: TimeSlotId,
        /// Reservation id
        reservation_id: ReservationId,
    },
    /// Seats were returned, from a held or a committed reservation
    Released {
        /// Slot id
        time_slot_id: TimeSlotId,
        /// Reservation id
        reservation_id: ReservationId,
    },
}

impl JournalEntry {
    /// Slot the entry belongs to.
    #[must_use]
    pub const fn time_slot_id(&self) -> TimeSlotId {
        match self {
            Self::SlotPublished { slot } => slot.id,
            Self::Reserved { reservation } => reservation.time_slot_id,
            Self::StatusChanged { time_slot_id, .. }
            | Self::Committed { time_slot_id, .. }
            | Self::Released { time_slot_id, .. } => *time_slot_id,
        }
    }
}

/// Append-only journal file.
#[derive(Debug)]
pub(crate) struct Journal {
    path: PathBuf,
    file: Mutex<File>,
}

fn io_error(path: &Path, err: &std::io::Error) -> CapacityError {
    CapacityError::Unavailable(format!("capacity journal {}: {err}", path.display()))
}

impl Journal {
    /// Read every entry in `path` (missing file: none) and open it for appending.
    pub(crate) async fn open(path: &Path) -> Result<(Self, Vec<JournalEntry>), CapacityError> {
        let entries = match tokio::fs::read_to_string(path).await {
            Ok(contents) => parse_entries(path, &contents)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(io_error(path, &err)),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| io_error(path, &e))?;

        tracing::info!(path = %path.display(), entries = entries.len(), "Capacity journal opened");

        Ok((
            Self {
                path: path.to_path_buf(),
                file: Mutex::new(file),
            },
            entries,
        ))
    }

    /// Append and sync one entry.
    pub(crate) async fn append(&self, entry: &JournalEntry) -> Result<(), CapacityError> {
        let mut line = serde_json::to_string(entry)
            .map_err(|e| CapacityError::Unavailable(format!("journal encode: {e}")))?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| io_error(&self.path, &e))?;
        file.sync_data().await.map_err(|e| io_error(&self.path, &e))
    }
}

fn parse_entries(path: &Path, contents: &str) -> Result<Vec<JournalEntry>, CapacityError> {
    let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
    let last = lines.len().saturating_sub(1);
    let torn_tail = !contents.ends_with('\n');

    let mut entries = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_str::<JournalEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(err) if index == last && torn_tail => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "Skipping torn final journal entry"
                );
            },
            Err(err) => {
                return Err(CapacityError::Unavailable(format!(
                    "capacity journal {} line {}: {err}",
                    path.display(),
                    index + 1
                )));
            },
        }
    }
    Ok(entries)
}
