//! Data models for Rigbook

mod checklist;
mod drive_log;
mod id;
mod sync_conflict;
mod tombstone;
mod vehicle;

pub use checklist::{Checklist, ChecklistItem, ItemState};
pub use drive_log::DriveLog;
pub use id::{EntityId, EntityKind};
pub use sync_conflict::{ConflictWinner, SyncConflict};
pub use tombstone::Tombstone;
pub use vehicle::{Trailer, Vehicle, VehicleType};

/// Next `last_modified` for a local edit.
///
/// Never goes backwards, even if the wall clock does, so an edit always
/// compares newer than the state it replaced.
pub(crate) fn bump_modified(previous: i64) -> i64 {
    crate::util::now_millis().max(previous.saturating_add(1))
}
