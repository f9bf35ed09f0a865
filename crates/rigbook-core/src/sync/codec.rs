//! Entity <-> record mapping.
//!
//! Each replicated type implements [`SyncEntity`]. Encoding always writes
//! the full field set. Decoding never lets an older or equal remote record
//! overwrite local scalar fields, while relationship fields are
//! re-evaluated against the local graph on every fetch.

use std::collections::HashSet;
use std::fmt;

use thiserror::Error;

use crate::graph::{GraphEntity, LocalGraph};
use crate::models::{
    Checklist, ChecklistItem, ConflictWinner, DriveLog, EntityId, EntityKind, ItemState,
    SyncConflict, Trailer, Vehicle, VehicleType,
};

use super::record::{FieldValue, Record, SavePolicy};

pub const FIELD_LAST_MODIFIED: &str = "lastModified";

/// A remote record that cannot become an entity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record {record_id} has type {found}, expected {expected}")]
    WrongRecordType {
        record_id: String,
        expected: &'static str,
        found: String,
    },
    #[error("record id {0} does not carry a valid entity id")]
    InvalidRecordId(String),
    #[error("record {record_id} is missing required field {field}")]
    MissingField {
        record_id: String,
        field: &'static str,
    },
    #[error("record {record_id} has an unreadable {field} field")]
    InvalidField {
        record_id: String,
        field: &'static str,
    },
}

/// State shared by the reconcilers of one sync pass.
#[derive(Debug, Default)]
pub struct MergeContext {
    /// Checklists whose scalar fields were replaced from the remote this
    /// pass; their item collections follow the remote too.
    pub refreshed_checklists: HashSet<EntityId>,
}

/// Capabilities the generic reconciler needs from an entity type.
pub trait SyncEntity: GraphEntity + PartialEq + fmt::Debug {
    /// How the base record is written.
    const SAVE_POLICY: SavePolicy = SavePolicy::AllKeys;

    fn last_modified(&self) -> Option<i64>;

    fn needs_push(&self) -> bool;

    fn set_needs_push(&mut self, pending: bool);

    /// Blank entity for an id first seen in a remote record.
    fn placeholder(id: EntityId) -> Self;

    /// Scalar fields plus relationships that can be written in one pass.
    fn encode(&self) -> Record;

    /// Relationship fields written after the base records are acknowledged.
    fn encode_deferred(&self) -> Option<Record> {
        None
    }

    /// Overwrite scalar fields (including `last_modified`) from the record.
    fn apply_scalars(&mut self, record: &Record);

    /// Point relationship fields at whatever the record currently expresses,
    /// resolved against entities present locally.
    fn relink(&mut self, record: &Record, graph: &LocalGraph);

    /// Remote modification time; types with their own timestamp require it.
    fn remote_modified(record: &Record) -> Result<Option<i64>, DecodeError> {
        let record_id = record.record_id.to_string();
        match record.get(FIELD_LAST_MODIFIED) {
            None => Err(DecodeError::MissingField {
                record_id,
                field: FIELD_LAST_MODIFIED,
            }),
            Some(_) => record
                .timestamp(FIELD_LAST_MODIFIED)
                .map(Some)
                .ok_or(DecodeError::InvalidField {
                    record_id,
                    field: FIELD_LAST_MODIFIED,
                }),
        }
    }

    /// Whether the remote record should replace local scalar fields.
    fn remote_wins(&self, _record: &Record, remote: Option<i64>, _ctx: &MergeContext) -> bool {
        match (self.last_modified(), remote) {
            (Some(local), Some(remote)) => remote > local,
            _ => false,
        }
    }

    fn on_scalars_applied(&self, _ctx: &mut MergeContext) {}

    /// Graph-wide normalization once every record of this type is merged.
    fn after_fetch(_graph: &mut LocalGraph, _ctx: &MergeContext, _seen: &HashSet<EntityId>) {}
}

/// Result of decoding one record.
#[derive(Debug)]
pub struct Decoded<E> {
    pub entity: E,
    pub created: bool,
    pub scalars_applied: bool,
    pub conflict: Option<SyncConflict>,
}

/// Extract and validate the entity id a record is keyed by.
pub fn entity_id_of(record: &Record, kind: EntityKind) -> Result<EntityId, DecodeError> {
    let expected = kind.type_tag();
    if record.record_type != expected {
        return Err(DecodeError::WrongRecordType {
            record_id: record.record_id.to_string(),
            expected,
            found: record.record_type.clone(),
        });
    }
    record
        .record_id
        .split()
        .filter(|(tag, _)| *tag == expected)
        .and_then(|(_, id)| id.parse().ok())
        .ok_or_else(|| DecodeError::InvalidRecordId(record.record_id.to_string()))
}

/// Decode `record` on top of `existing`.
///
/// Scalars are applied only when there is no local copy or the remote is
/// strictly newer (ties favor local). Relationships are re-read from the
/// record either way, so a reference the remote no longer carries is
/// cleared locally.
pub fn decode<E: SyncEntity>(
    record: &Record,
    existing: Option<&E>,
    graph: &LocalGraph,
    ctx: &mut MergeContext,
) -> Result<Decoded<E>, DecodeError> {
    let id = entity_id_of(record, E::KIND)?;
    let remote_modified = E::remote_modified(record)?;

    let (mut entity, created) = match existing {
        Some(local) => (local.clone(), false),
        None => (E::placeholder(id), true),
    };

    let scalars_applied = created || entity.remote_wins(record, remote_modified, ctx);
    let conflict = existing
        .filter(|local| local.needs_push())
        .and_then(|local| conflict_for(local, id, remote_modified, scalars_applied));

    if scalars_applied {
        entity.apply_scalars(record);
        entity.set_needs_push(false);
        entity.on_scalars_applied(ctx);
    }

    entity.relink(record, graph);

    Ok(Decoded {
        entity,
        created,
        scalars_applied,
        conflict,
    })
}

fn conflict_for<E: SyncEntity>(
    local: &E,
    id: EntityId,
    remote_modified: Option<i64>,
    remote_won: bool,
) -> Option<SyncConflict> {
    let local_modified = local.last_modified()?;
    let remote_modified = remote_modified?;
    if local_modified == remote_modified {
        return None;
    }

    Some(SyncConflict {
        id: 0,
        entity_kind: E::KIND,
        entity_id: id.to_string(),
        local_modified,
        remote_modified,
        resolved_at: crate::util::now_millis(),
        winner: if remote_won {
            ConflictWinner::Remote
        } else {
            ConflictWinner::Local
        },
        strategy: "lww".to_string(),
    })
}

/// Resolve a reference field to a locally present entity of type `T`.
///
/// Missing, mistyped and dangling references all resolve to `None`.
pub fn resolve_reference<T: GraphEntity>(
    record: &Record,
    key: &str,
    graph: &LocalGraph,
) -> Option<EntityId> {
    let (tag, id) = record.reference(key)?.split()?;
    if tag != T::KIND.type_tag() {
        return None;
    }
    let id = id.parse::<EntityId>().ok()?;
    graph.get::<T>(&id).map(|_| id)
}

fn timestamp(value: i64) -> FieldValue {
    FieldValue::Timestamp(value)
}

impl SyncEntity for Vehicle {
    // The trailer link is written in the second phase; the base write
    // must not clear it in the meantime.
    const SAVE_POLICY: SavePolicy = SavePolicy::ChangedKeys;

    fn last_modified(&self) -> Option<i64> {
        Some(self.last_modified)
    }

    fn needs_push(&self) -> bool {
        self.needs_push
    }

    fn set_needs_push(&mut self, pending: bool) {
        self.needs_push = pending;
    }

    fn placeholder(id: EntityId) -> Self {
        Self {
            id,
            last_modified: 0,
            ..Self::new(VehicleType::default())
        }
    }

    fn encode(&self) -> Record {
        Record::for_entity(EntityKind::Vehicle, &self.id)
            .with_text("vehicleType", self.vehicle_type.as_str())
            .with_text("brand", &self.brand)
            .with_text("model", &self.model)
            .with_text("color", &self.color)
            .with_text("plate", &self.plate)
            .with_text("notes", &self.notes)
            .with_asset("photo", self.photo.as_deref())
            .with(FIELD_LAST_MODIFIED, timestamp(self.last_modified))
    }

    fn encode_deferred(&self) -> Option<Record> {
        Some(
            Record::for_entity(EntityKind::Vehicle, &self.id).with_reference(
                "trailer",
                EntityKind::Trailer,
                self.trailer_id.as_ref(),
            ),
        )
    }

    fn apply_scalars(&mut self, record: &Record) {
        self.vehicle_type = VehicleType::parse_lenient(&record.text("vehicleType"));
        self.brand = record.text("brand");
        self.model = record.text("model");
        self.color = record.text("color");
        self.plate = record.text("plate");
        self.notes = record.text("notes");
        self.photo = record.asset("photo");
        self.last_modified = record.int(FIELD_LAST_MODIFIED);
    }

    fn relink(&mut self, record: &Record, graph: &LocalGraph) {
        self.trailer_id = resolve_reference::<Trailer>(record, "trailer", graph);
    }

    fn after_fetch(graph: &mut LocalGraph, _ctx: &MergeContext, _seen: &HashSet<EntityId>) {
        enforce_single_hitch(graph);
    }
}

/// A trailer is hitched to at most one vehicle; the most recently
/// modified vehicle keeps the link.
fn enforce_single_hitch(graph: &mut LocalGraph) {
    let mut claims = graph
        .vehicles()
        .filter_map(|vehicle| {
            vehicle
                .trailer_id
                .map(|trailer| (trailer, vehicle.last_modified, vehicle.id))
        })
        .collect::<Vec<_>>();
    claims.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));

    let mut losers = Vec::new();
    for pair in claims.windows(2) {
        if pair[0].0 == pair[1].0 {
            losers.push(pair[1].2);
        }
    }
    for id in losers {
        if let Some(vehicle) = graph.get_mut::<Vehicle>(&id) {
            tracing::debug!("Clearing duplicate trailer link on vehicle {id}");
            vehicle.trailer_id = None;
        }
    }
}

impl SyncEntity for Trailer {
    fn last_modified(&self) -> Option<i64> {
        Some(self.last_modified)
    }

    fn needs_push(&self) -> bool {
        self.needs_push
    }

    fn set_needs_push(&mut self, pending: bool) {
        self.needs_push = pending;
    }

    fn placeholder(id: EntityId) -> Self {
        Self {
            id,
            last_modified: 0,
            ..Self::new()
        }
    }

    fn encode(&self) -> Record {
        Record::for_entity(EntityKind::Trailer, &self.id)
            .with_text("brand", &self.brand)
            .with_text("model", &self.model)
            .with_text("color", &self.color)
            .with_text("plate", &self.plate)
            .with_text("notes", &self.notes)
            .with_asset("photo", self.photo.as_deref())
            .with(FIELD_LAST_MODIFIED, timestamp(self.last_modified))
    }

    fn apply_scalars(&mut self, record: &Record) {
        self.brand = record.text("brand");
        self.model = record.text("model");
        self.color = record.text("color");
        self.plate = record.text("plate");
        self.notes = record.text("notes");
        self.photo = record.asset("photo");
        self.last_modified = record.int(FIELD_LAST_MODIFIED);
    }

    fn relink(&mut self, _record: &Record, _graph: &LocalGraph) {}
}

impl SyncEntity for Checklist {
    fn last_modified(&self) -> Option<i64> {
        Some(self.last_modified)
    }

    fn needs_push(&self) -> bool {
        self.needs_push
    }

    fn set_needs_push(&mut self, pending: bool) {
        self.needs_push = pending;
    }

    fn placeholder(id: EntityId) -> Self {
        Self {
            id,
            last_modified: 0,
            ..Self::new(VehicleType::default(), "")
        }
    }

    fn encode(&self) -> Record {
        Record::for_entity(EntityKind::Checklist, &self.id)
            .with_text("vehicleType", self.vehicle_type.as_str())
            .with_text("title", &self.title)
            .with_reference("vehicle", EntityKind::Vehicle, self.vehicle_id.as_ref())
            .with_reference("trailer", EntityKind::Trailer, self.trailer_id.as_ref())
            .with(FIELD_LAST_MODIFIED, timestamp(self.last_modified))
    }

    fn apply_scalars(&mut self, record: &Record) {
        self.vehicle_type = VehicleType::parse_lenient(&record.text("vehicleType"));
        self.title = record.text("title");
        self.last_modified = record.int(FIELD_LAST_MODIFIED);
    }

    fn relink(&mut self, record: &Record, graph: &LocalGraph) {
        self.vehicle_id = resolve_reference::<Vehicle>(record, "vehicle", graph);
        self.trailer_id = resolve_reference::<Trailer>(record, "trailer", graph);
    }

    fn on_scalars_applied(&self, ctx: &mut MergeContext) {
        ctx.refreshed_checklists.insert(self.id);
    }
}

impl SyncEntity for DriveLog {
    fn last_modified(&self) -> Option<i64> {
        Some(self.last_modified)
    }

    fn needs_push(&self) -> bool {
        self.needs_push
    }

    fn set_needs_push(&mut self, pending: bool) {
        self.needs_push = pending;
    }

    fn placeholder(id: EntityId) -> Self {
        Self {
            id,
            vehicle_id: None,
            date: 0,
            last_modified: 0,
            ..Self::new(id)
        }
    }

    fn encode(&self) -> Record {
        Record::for_entity(EntityKind::DriveLog, &self.id)
            .with_reference("vehicle", EntityKind::Vehicle, self.vehicle_id.as_ref())
            .with("date", timestamp(self.date))
            .with_text("reason", &self.reason)
            .with("startOdometer", FieldValue::Double(self.start_odometer))
            .with("endOdometer", FieldValue::Double(self.end_odometer))
            .with_text("notes", &self.notes)
            .with_reference("checklist", EntityKind::Checklist, self.checklist_id.as_ref())
            .with(FIELD_LAST_MODIFIED, timestamp(self.last_modified))
    }

    fn apply_scalars(&mut self, record: &Record) {
        self.date = record.int("date");
        self.reason = record.text("reason");
        self.start_odometer = record.double("startOdometer");
        self.end_odometer = record.double("endOdometer");
        self.notes = record.text("notes");
        self.last_modified = record.int(FIELD_LAST_MODIFIED);
    }

    fn relink(&mut self, record: &Record, graph: &LocalGraph) {
        self.vehicle_id = resolve_reference::<Vehicle>(record, "vehicle", graph);
        self.checklist_id = resolve_reference::<Checklist>(record, "checklist", graph);
    }
}

impl SyncEntity for ChecklistItem {
    fn last_modified(&self) -> Option<i64> {
        None
    }

    fn needs_push(&self) -> bool {
        self.needs_push
    }

    fn set_needs_push(&mut self, pending: bool) {
        self.needs_push = pending;
    }

    fn placeholder(id: EntityId) -> Self {
        Self {
            id,
            checklist_id: None,
            position: 0,
            section: String::new(),
            title: String::new(),
            state: ItemState::Unset,
            note: None,
            needs_push: false,
        }
    }

    fn encode(&self) -> Record {
        Record::for_entity(EntityKind::ChecklistItem, &self.id)
            .with_reference("checklist", EntityKind::Checklist, self.checklist_id.as_ref())
            .with("position", FieldValue::Int(self.position))
            .with_text("section", &self.section)
            .with_text("title", &self.title)
            .with_text("state", self.state.as_str())
            .with_optional_text("note", self.note.as_deref())
    }

    fn apply_scalars(&mut self, record: &Record) {
        self.position = record.int("position");
        self.section = record.text("section");
        self.title = record.text("title");
        self.state = ItemState::parse_lenient(&record.text("state"));
        self.note = record.optional_text("note");
    }

    fn relink(&mut self, record: &Record, graph: &LocalGraph) {
        self.checklist_id = resolve_reference::<Checklist>(record, "checklist", graph);
    }

    fn remote_modified(_record: &Record) -> Result<Option<i64>, DecodeError> {
        Ok(None)
    }

    // Items follow their checklist: when the checklist was replaced from
    // the remote, so is every item of it.
    fn remote_wins(&self, record: &Record, _remote: Option<i64>, ctx: &MergeContext) -> bool {
        record
            .reference("checklist")
            .and_then(|reference| reference.split())
            .and_then(|(_, id)| id.parse::<EntityId>().ok())
            .is_some_and(|checklist_id| ctx.refreshed_checklists.contains(&checklist_id))
    }

    fn after_fetch(graph: &mut LocalGraph, ctx: &MergeContext, seen: &HashSet<EntityId>) {
        let stale = graph
            .checklist_items()
            .filter(|item| {
                item.checklist_id
                    .is_some_and(|checklist| ctx.refreshed_checklists.contains(&checklist))
                    && !seen.contains(&item.id)
            })
            .map(|item| item.id)
            .collect::<Vec<_>>();

        for id in stale {
            tracing::debug!("Dropping checklist item {id} absent from refreshed checklist");
            graph.remove::<ChecklistItem>(&id);
        }
    }
}
