//! Tombstone model

use serde::{Deserialize, Serialize};

use super::{EntityId, EntityKind};

/// Durable marker that an entity was deleted on some replica.
///
/// Unique per `(kind, entity_id)`. Its presence is authoritative over any
/// record for the same id still held locally or remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tombstone {
    pub kind: EntityKind,
    pub entity_id: EntityId,
    /// Deletion timestamp (Unix ms)
    pub deleted_at: i64,
    /// Whether the remote store has acknowledged this tombstone
    pub pushed: bool,
}

impl Tombstone {
    #[must_use]
    pub const fn new(kind: EntityKind, entity_id: EntityId, deleted_at: i64) -> Self {
        Self {
            kind,
            entity_id,
            deleted_at,
            pushed: false,
        }
    }

    #[must_use]
    pub const fn key(&self) -> (EntityKind, EntityId) {
        (self.kind, self.entity_id)
    }
}
