//! Tombstone bookkeeping on top of the local graph.
//!
//! A tombstone means "no replica should hold this id". Tombstones are kept
//! locally after they are pushed and are never removed from the remote,
//! so replicas that sync late still converge.

use std::collections::HashSet;

use tracing::debug;

use crate::graph::{EntityKey, LocalGraph};
use crate::models::{EntityId, EntityKind, Tombstone};

use super::codec::DecodeError;
use super::record::{FieldValue, Record, RecordId, TOMBSTONE_RECORD_TYPE};

const FIELD_ENTITY_TYPE: &str = "entityType";
const FIELD_ENTITY_ID: &str = "entityId";
const FIELD_DELETED_AT: &str = "deletedAt";

/// Result of applying remote tombstones.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AppliedTombstones {
    /// Remote tombstones this replica had not seen before
    pub learned: usize,
    /// Local entities removed because of them, dependents included
    pub removed: usize,
    /// Dependents tombstoned locally by the cascade, still to be pushed
    pub cascaded: Vec<EntityKey>,
}

pub struct TombstoneLedger<'g> {
    graph: &'g mut LocalGraph,
}

impl<'g> TombstoneLedger<'g> {
    pub fn new(graph: &'g mut LocalGraph) -> Self {
        Self { graph }
    }

    /// Upsert a tombstone for `(kind, id)` and, with `cascade`, for every
    /// structural dependent. Re-deleting refreshes the timestamp and queues
    /// the tombstone for another push.
    ///
    /// Entities stay in the graph; see [`Self::delete_cascade`].
    pub fn mark_deleted(
        &mut self,
        kind: EntityKind,
        id: EntityId,
        cascade: bool,
        now: i64,
    ) -> Vec<EntityKey> {
        let mut keys = vec![(kind, id)];
        if cascade {
            keys.extend(self.graph.dependents(kind, &id));
        }

        for key in &keys {
            self.upsert(*key, now);
        }
        keys
    }

    /// Tombstone the entity with its dependents and remove them all locally.
    pub fn delete_cascade(&mut self, kind: EntityKind, id: EntityId, now: i64) -> Vec<EntityKey> {
        let keys = self.mark_deleted(kind, id, true, now);
        for (kind, id) in &keys {
            self.graph.remove_entity(*kind, id);
        }
        keys
    }

    /// Ids that must not be pushed or materialized.
    pub fn active_tombstones(&self) -> HashSet<EntityId> {
        self.graph.tombstoned_ids()
    }

    /// Tombstones the remote has not acknowledged yet.
    pub fn pending(&self) -> Vec<Tombstone> {
        self.graph
            .tombstones()
            .filter(|tombstone| !tombstone.pushed)
            .copied()
            .collect()
    }

    pub fn mark_pushed(&mut self, keys: &[EntityKey]) {
        for key in keys {
            if let Some(tombstone) = self.graph.tombstone_mut(key) {
                tombstone.pushed = true;
            }
        }
    }

    /// Apply tombstones fetched from the remote.
    ///
    /// Unknown tombstones are recorded as already pushed, their entities are
    /// removed, and dependents that were not tombstoned yet get new local
    /// tombstones so the cascade reaches the remote too.
    ///
    /// A known tombstone keeps its `pushed` flag: seeing the tombstone record
    /// remotely says nothing about whether the entity record is gone.
    pub fn apply_remote(&mut self, remote: &[Tombstone], now: i64) -> AppliedTombstones {
        let mut applied = AppliedTombstones::default();
        let mut fresh = Vec::new();

        for incoming in remote {
            let key = incoming.key();
            if let Some(known) = self.graph.tombstone_mut(&key) {
                if known.pushed {
                    known.deleted_at = known.deleted_at.max(incoming.deleted_at);
                }
                continue;
            }
            self.graph.put_tombstone(Tombstone {
                pushed: true,
                ..*incoming
            });
            applied.learned += 1;
            fresh.push(key);
        }

        for (kind, id) in fresh {
            for dependent in self.graph.dependents(kind, &id) {
                if self.graph.tombstone(dependent.0, &dependent.1).is_none() {
                    self.upsert(dependent, now);
                    applied.cascaded.push(dependent);
                }
                if self.graph.remove_entity(dependent.0, &dependent.1) {
                    applied.removed += 1;
                }
            }
            if self.graph.remove_entity(kind, &id) {
                debug!("Removed {} {id} deleted on another device", kind.type_tag());
                applied.removed += 1;
            }
        }

        applied
    }

    fn upsert(&mut self, key: EntityKey, now: i64) {
        if let Some(existing) = self.graph.tombstone_mut(&key) {
            existing.deleted_at = now;
            existing.pushed = false;
        } else {
            self.graph.put_tombstone(Tombstone::new(key.0, key.1, now));
        }
    }
}

pub fn encode_tombstone(tombstone: &Tombstone) -> Record {
    Record::new(
        TOMBSTONE_RECORD_TYPE,
        RecordId::for_tombstone(&tombstone.entity_id),
    )
    .with_text(FIELD_ENTITY_TYPE, tombstone.kind.type_tag())
    .with_text(FIELD_ENTITY_ID, &tombstone.entity_id.to_string())
    .with(FIELD_DELETED_AT, FieldValue::Timestamp(tombstone.deleted_at))
}

/// Decode a remote tombstone record; the result is marked as pushed.
pub fn decode_tombstone(record: &Record) -> Result<Tombstone, DecodeError> {
    let record_id = record.record_id.to_string();
    if record.record_type != TOMBSTONE_RECORD_TYPE {
        return Err(DecodeError::WrongRecordType {
            record_id,
            expected: TOMBSTONE_RECORD_TYPE,
            found: record.record_type.clone(),
        });
    }

    let kind = EntityKind::from_type_tag(&record.text(FIELD_ENTITY_TYPE)).ok_or_else(|| {
        DecodeError::InvalidField {
            record_id: record_id.clone(),
            field: FIELD_ENTITY_TYPE,
        }
    })?;
    let entity_id = record
        .optional_text(FIELD_ENTITY_ID)
        .ok_or_else(|| DecodeError::MissingField {
            record_id: record_id.clone(),
            field: FIELD_ENTITY_ID,
        })?
        .parse::<EntityId>()
        .map_err(|_| DecodeError::InvalidRecordId(record_id.clone()))?;
    let deleted_at = record
        .timestamp(FIELD_DELETED_AT)
        .ok_or(DecodeError::MissingField {
            record_id,
            field: FIELD_DELETED_AT,
        })?;

    Ok(Tombstone {
        kind,
        entity_id,
        deleted_at,
        pushed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Checklist, ChecklistItem, DriveLog, Trailer, Vehicle, VehicleType};
    use pretty_assertions::assert_eq;

    struct Fleet {
        graph: LocalGraph,
        vehicle: Vehicle,
        logs: Vec<DriveLog>,
        checklists: Vec<Checklist>,
        items: usize,
    }

    /// Vehicle with 2 drive logs and 2 checklists of 3 and 2 items.
    fn fleet() -> Fleet {
        let mut graph = LocalGraph::new();
        let vehicle = Vehicle::new(VehicleType::Truck);
        graph.insert(vehicle.clone());

        let logs = (0..2)
            .map(|_| DriveLog::new(vehicle.id))
            .collect::<Vec<_>>();
        for log in &logs {
            graph.insert(log.clone());
        }

        let mut checklists = Vec::new();
        let mut items = 0;
        for count in [3, 2] {
            let mut checklist = Checklist::new(VehicleType::Truck, "Pre-trip");
            checklist.vehicle_id = Some(vehicle.id);
            for position in 0..count {
                graph.insert(ChecklistItem::new(checklist.id, position, "", "Check"));
                items += 1;
            }
            graph.insert(checklist.clone());
            checklists.push(checklist);
        }

        Fleet {
            graph,
            vehicle,
            logs,
            checklists,
            items,
        }
    }

    #[test]
    fn cascade_covers_every_dependent() {
        let mut fleet = fleet();
        let expected = 1 + fleet.logs.len() + fleet.checklists.len() + fleet.items;

        let keys = TombstoneLedger::new(&mut fleet.graph).delete_cascade(
            EntityKind::Vehicle,
            fleet.vehicle.id,
            1_000,
        );

        assert_eq!(keys.len(), expected);
        assert_eq!(fleet.graph.tombstones().count(), expected);
        assert_eq!(fleet.graph.len_of(EntityKind::Vehicle), 0);
        assert_eq!(fleet.graph.len_of(EntityKind::DriveLog), 0);
        assert_eq!(fleet.graph.len_of(EntityKind::Checklist), 0);
        assert_eq!(fleet.graph.len_of(EntityKind::ChecklistItem), 0);
    }

    #[test]
    fn mark_deleted_is_an_upsert() {
        let mut graph = LocalGraph::new();
        let trailer = Trailer::new();
        graph.insert(trailer.clone());
        let mut ledger = TombstoneLedger::new(&mut graph);

        ledger.mark_deleted(EntityKind::Trailer, trailer.id, false, 10);
        ledger.mark_pushed(&[(EntityKind::Trailer, trailer.id)]);
        ledger.mark_deleted(EntityKind::Trailer, trailer.id, false, 20);

        let pending = ledger.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].deleted_at, 20);
        assert!(ledger.active_tombstones().contains(&trailer.id));
    }

    #[test]
    fn apply_remote_removes_and_cascades() {
        let mut fleet = fleet();
        let remote = Tombstone::new(EntityKind::Vehicle, fleet.vehicle.id, 500);

        let applied = TombstoneLedger::new(&mut fleet.graph).apply_remote(&[remote], 900);

        let dependents = fleet.logs.len() + fleet.checklists.len() + fleet.items;
        assert_eq!(applied.learned, 1);
        assert_eq!(applied.removed, 1 + dependents);
        assert_eq!(applied.cascaded.len(), dependents);

        let ledger = TombstoneLedger::new(&mut fleet.graph);
        let pending = ledger.pending();
        assert_eq!(pending.len(), dependents);
        assert!(pending.iter().all(|tombstone| tombstone.deleted_at == 900));
        let vehicle_tombstone = fleet
            .graph
            .tombstone(EntityKind::Vehicle, &fleet.vehicle.id)
            .unwrap();
        assert!(vehicle_tombstone.pushed);
    }

    #[test]
    fn apply_remote_is_idempotent() {
        let mut fleet = fleet();
        let remote = [Tombstone::new(EntityKind::Vehicle, fleet.vehicle.id, 500)];

        TombstoneLedger::new(&mut fleet.graph).apply_remote(&remote, 900);
        let again = TombstoneLedger::new(&mut fleet.graph).apply_remote(&remote, 901);

        assert_eq!(again, AppliedTombstones::default());
    }

    #[test]
    fn apply_remote_leaves_pending_local_tombstone_pending() {
        let mut graph = LocalGraph::new();
        let id = EntityId::new();
        let mut ledger = TombstoneLedger::new(&mut graph);
        ledger.mark_deleted(EntityKind::DriveLog, id, false, 10);

        let applied = ledger.apply_remote(&[Tombstone::new(EntityKind::DriveLog, id, 30)], 40);

        assert_eq!(applied, AppliedTombstones::default());
        let pending = ledger.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].deleted_at, 10);
    }

    #[test]
    fn tombstone_record_round_trip() {
        let tombstone = Tombstone::new(EntityKind::Checklist, EntityId::new(), 1_234);
        let record = encode_tombstone(&tombstone);

        assert_eq!(
            record.record_id,
            RecordId::for_tombstone(&tombstone.entity_id)
        );
        let decoded = decode_tombstone(&record).unwrap();
        assert_eq!(decoded.key(), tombstone.key());
        assert_eq!(decoded.deleted_at, 1_234);
        assert!(decoded.pushed);
    }

    #[test]
    fn malformed_tombstone_record_is_rejected() {
        let record = Record::new(TOMBSTONE_RECORD_TYPE, RecordId::from("Tombstone_x"))
            .with_text(FIELD_ENTITY_TYPE, "Spaceship");
        assert!(matches!(
            decode_tombstone(&record),
            Err(DecodeError::InvalidField { .. })
        ));
    }
}
