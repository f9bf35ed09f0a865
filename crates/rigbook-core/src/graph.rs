//! In-memory local object graph.
//!
//! Entities live in id-indexed tables and point at each other by id only,
//! so a reference to an entity that is not (or no longer) present is just
//! a dangling id, never an ownership cycle. Every mutation made through
//! the graph is recorded in [`PendingChanges`] so the local store can
//! persist exactly what changed.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::models::{
    Checklist, ChecklistItem, DriveLog, EntityId, EntityKind, Tombstone, Trailer, Vehicle,
};

/// Key of a row in the graph.
pub type EntityKey = (EntityKind, EntityId);

/// Entity types stored in a [`LocalGraph`] table.
pub trait GraphEntity: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn entity_id(&self) -> EntityId;

    fn table(graph: &LocalGraph) -> &BTreeMap<EntityId, Self>;

    fn table_mut(graph: &mut LocalGraph) -> &mut BTreeMap<EntityId, Self>;
}

macro_rules! graph_entity {
    ($ty:ty, $kind:expr, $field:ident) => {
        impl GraphEntity for $ty {
            const KIND: EntityKind = $kind;

            fn entity_id(&self) -> EntityId {
                self.id
            }

            fn table(graph: &LocalGraph) -> &BTreeMap<EntityId, Self> {
                &graph.$field
            }

            fn table_mut(graph: &mut LocalGraph) -> &mut BTreeMap<EntityId, Self> {
                &mut graph.$field
            }
        }
    };
}

graph_entity!(Vehicle, EntityKind::Vehicle, vehicles);
graph_entity!(Trailer, EntityKind::Trailer, trailers);
graph_entity!(DriveLog, EntityKind::DriveLog, drive_logs);
graph_entity!(Checklist, EntityKind::Checklist, checklists);
graph_entity!(ChecklistItem, EntityKind::ChecklistItem, items);

/// Mutations not yet written to the local store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChanges {
    pub upserted: BTreeSet<EntityKey>,
    pub removed: BTreeSet<EntityKey>,
    pub tombstones: BTreeSet<EntityKey>,
}

impl PendingChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.removed.is_empty() && self.tombstones.is_empty()
    }
}

/// The local replica's working set.
#[derive(Debug, Clone, Default)]
pub struct LocalGraph {
    vehicles: BTreeMap<EntityId, Vehicle>,
    trailers: BTreeMap<EntityId, Trailer>,
    drive_logs: BTreeMap<EntityId, DriveLog>,
    checklists: BTreeMap<EntityId, Checklist>,
    items: BTreeMap<EntityId, ChecklistItem>,
    tombstones: BTreeMap<EntityKey, Tombstone>,
    changes: PendingChanges,
}

impl LocalGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<E: GraphEntity>(&self, id: &EntityId) -> Option<&E> {
        E::table(self).get(id)
    }

    /// Mutable access; the entity is assumed changed and queued for saving.
    pub fn get_mut<E: GraphEntity>(&mut self, id: &EntityId) -> Option<&mut E> {
        if E::table(self).contains_key(id) {
            self.mark_upserted(E::KIND, *id);
        }
        E::table_mut(self).get_mut(id)
    }

    pub fn insert<E: GraphEntity>(&mut self, entity: E) {
        self.mark_upserted(E::KIND, entity.entity_id());
        E::table_mut(self).insert(entity.entity_id(), entity);
    }

    pub fn remove<E: GraphEntity>(&mut self, id: &EntityId) -> Option<E> {
        let removed = E::table_mut(self).remove(id);
        if removed.is_some() {
            self.changes.upserted.remove(&(E::KIND, *id));
            self.changes.removed.insert((E::KIND, *id));
        }
        removed
    }

    pub fn all<E: GraphEntity>(&self) -> impl Iterator<Item = &E> {
        E::table(self).values()
    }

    pub fn ids<E: GraphEntity>(&self) -> Vec<EntityId> {
        E::table(self).keys().copied().collect()
    }

    #[must_use]
    pub fn contains(&self, kind: EntityKind, id: &EntityId) -> bool {
        match kind {
            EntityKind::Vehicle => self.vehicles.contains_key(id),
            EntityKind::Trailer => self.trailers.contains_key(id),
            EntityKind::DriveLog => self.drive_logs.contains_key(id),
            EntityKind::Checklist => self.checklists.contains_key(id),
            EntityKind::ChecklistItem => self.items.contains_key(id),
        }
    }

    #[must_use]
    pub fn len_of(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Vehicle => self.vehicles.len(),
            EntityKind::Trailer => self.trailers.len(),
            EntityKind::DriveLog => self.drive_logs.len(),
            EntityKind::Checklist => self.checklists.len(),
            EntityKind::ChecklistItem => self.items.len(),
        }
    }

    pub fn vehicles(&self) -> impl Iterator<Item = &Vehicle> {
        self.vehicles.values()
    }

    pub fn trailers(&self) -> impl Iterator<Item = &Trailer> {
        self.trailers.values()
    }

    pub fn drive_logs(&self) -> impl Iterator<Item = &DriveLog> {
        self.drive_logs.values()
    }

    pub fn checklists(&self) -> impl Iterator<Item = &Checklist> {
        self.checklists.values()
    }

    pub fn checklist_items(&self) -> impl Iterator<Item = &ChecklistItem> {
        self.items.values()
    }

    /// Items of a checklist in display order.
    #[must_use]
    pub fn items_of(&self, checklist_id: &EntityId) -> Vec<&ChecklistItem> {
        let mut items = self
            .items
            .values()
            .filter(|item| item.checklist_id.as_ref() == Some(checklist_id))
            .collect::<Vec<_>>();
        items.sort_by_key(|item| (item.position, item.id));
        items
    }

    #[must_use]
    pub fn logs_of(&self, vehicle_id: &EntityId) -> Vec<&DriveLog> {
        let mut logs = self
            .drive_logs
            .values()
            .filter(|log| log.vehicle_id.as_ref() == Some(vehicle_id))
            .collect::<Vec<_>>();
        logs.sort_by_key(|log| std::cmp::Reverse(log.date));
        logs
    }

    /// Structural dependents that are tombstoned together with `id`.
    ///
    /// Vehicle: its drive logs, its checklists and their items.
    /// Trailer: its checklists and their items. Checklist: its items.
    #[must_use]
    pub fn dependents(&self, kind: EntityKind, id: &EntityId) -> Vec<EntityKey> {
        let mut out = Vec::new();
        let owned_checklists = |owner: &dyn Fn(&Checklist) -> bool| {
            self.checklists
                .values()
                .filter(|checklist| owner(checklist))
                .map(|checklist| checklist.id)
                .collect::<Vec<_>>()
        };

        let checklists = match kind {
            EntityKind::Vehicle => {
                out.extend(
                    self.drive_logs
                        .values()
                        .filter(|log| log.vehicle_id.as_ref() == Some(id))
                        .map(|log| (EntityKind::DriveLog, log.id)),
                );
                owned_checklists(&|checklist: &Checklist| {
                    checklist.vehicle_id.as_ref() == Some(id)
                })
            }
            EntityKind::Trailer => {
                owned_checklists(&|checklist: &Checklist| {
                    checklist.trailer_id.as_ref() == Some(id)
                })
            }
            EntityKind::Checklist => {
                out.extend(
                    self.items_of(id)
                        .into_iter()
                        .map(|item| (EntityKind::ChecklistItem, item.id)),
                );
                Vec::new()
            }
            EntityKind::DriveLog | EntityKind::ChecklistItem => Vec::new(),
        };

        for checklist_id in checklists {
            out.push((EntityKind::Checklist, checklist_id));
            out.extend(
                self.items_of(&checklist_id)
                    .into_iter()
                    .map(|item| (EntityKind::ChecklistItem, item.id)),
            );
        }

        out
    }

    /// Remove an entity and clear every relationship that pointed at it.
    ///
    /// Returns whether the entity was present.
    pub fn remove_entity(&mut self, kind: EntityKind, id: &EntityId) -> bool {
        let removed = match kind {
            EntityKind::Vehicle => self.remove::<Vehicle>(id).is_some(),
            EntityKind::Trailer => self.remove::<Trailer>(id).is_some(),
            EntityKind::DriveLog => self.remove::<DriveLog>(id).is_some(),
            EntityKind::Checklist => self.remove::<Checklist>(id).is_some(),
            EntityKind::ChecklistItem => self.remove::<ChecklistItem>(id).is_some(),
        };
        self.unlink_references(kind, id);
        removed
    }

    /// Clear relationship fields pointing at `(kind, id)`.
    ///
    /// This is local normalization, not an edit: timestamps and pending
    /// flags are left alone.
    pub fn unlink_references(&mut self, kind: EntityKind, id: &EntityId) {
        let target = Some(*id);
        match kind {
            EntityKind::Trailer => {
                self.unlink::<Vehicle>(|v| &mut v.trailer_id, target);
                self.unlink::<Checklist>(|c| &mut c.trailer_id, target);
            }
            EntityKind::Vehicle => {
                self.unlink::<DriveLog>(|l| &mut l.vehicle_id, target);
                self.unlink::<Checklist>(|c| &mut c.vehicle_id, target);
            }
            EntityKind::Checklist => {
                self.unlink::<DriveLog>(|l| &mut l.checklist_id, target);
                self.unlink::<ChecklistItem>(|i| &mut i.checklist_id, target);
            }
            EntityKind::DriveLog | EntityKind::ChecklistItem => {}
        }
    }

    fn unlink<E: GraphEntity>(
        &mut self,
        field: impl Fn(&mut E) -> &mut Option<EntityId>,
        target: Option<EntityId>,
    ) {
        let mut touched = Vec::new();
        for entity in E::table_mut(self).values_mut() {
            let slot = field(entity);
            if *slot == target {
                *slot = None;
                touched.push(entity.entity_id());
            }
        }
        for id in touched {
            self.mark_upserted(E::KIND, id);
        }
    }

    pub fn tombstone(&self, kind: EntityKind, id: &EntityId) -> Option<&Tombstone> {
        self.tombstones.get(&(kind, *id))
    }

    pub fn tombstones(&self) -> impl Iterator<Item = &Tombstone> {
        self.tombstones.values()
    }

    pub(crate) fn tombstone_mut(&mut self, key: &EntityKey) -> Option<&mut Tombstone> {
        if self.tombstones.contains_key(key) {
            self.changes.tombstones.insert(*key);
        }
        self.tombstones.get_mut(key)
    }

    pub(crate) fn put_tombstone(&mut self, tombstone: Tombstone) {
        self.changes.tombstones.insert(tombstone.key());
        self.tombstones.insert(tombstone.key(), tombstone);
    }

    /// Ids of every tombstoned entity, regardless of type.
    #[must_use]
    pub fn tombstoned_ids(&self) -> HashSet<EntityId> {
        self.tombstones.keys().map(|(_, id)| *id).collect()
    }

    #[must_use]
    pub const fn changes(&self) -> &PendingChanges {
        &self.changes
    }

    /// Hand the accumulated changes to the caller and start a fresh set.
    pub fn take_changes(&mut self) -> PendingChanges {
        std::mem::take(&mut self.changes)
    }

    /// Put back changes that failed to persist so the next save retries them.
    pub fn restore_changes(&mut self, changes: PendingChanges) {
        for key in changes.upserted {
            if !self.changes.removed.contains(&key) {
                self.changes.upserted.insert(key);
            }
        }
        for key in changes.removed {
            if !self.changes.upserted.contains(&key) {
                self.changes.removed.insert(key);
            }
        }
        self.changes.tombstones.extend(changes.tombstones);
    }

    /// Insert loaded rows without recording them as changes.
    pub(crate) fn load<E: GraphEntity>(&mut self, entity: E) {
        E::table_mut(self).insert(entity.entity_id(), entity);
    }

    pub(crate) fn load_tombstone(&mut self, tombstone: Tombstone) {
        self.tombstones.insert(tombstone.key(), tombstone);
    }

    fn mark_upserted(&mut self, kind: EntityKind, id: EntityId) {
        self.changes.removed.remove(&(kind, id));
        self.changes.upserted.insert((kind, id));
    }
}
