//! JSON snapshots of the whole garage.
//!
//! Snapshots are separate from live sync. Timestamps are ISO-8601 and
//! photos base64. Importing merges by entity id with the sync rule: the
//! incoming copy wins only when strictly newer, and tombstoned ids are
//! never brought back.

use std::collections::HashSet;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::{GraphEntity, LocalGraph};
use crate::models::{
    Checklist, ChecklistItem, DriveLog, EntityId, EntityKind, ItemState, Trailer, Vehicle,
    VehicleType,
};
use crate::sync::TombstoneLedger;
use crate::util::now_millis;
use crate::{Error, Result};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    #[serde(default)]
    pub trailers: Vec<ExportTrailer>,
    #[serde(default)]
    pub vehicles: Vec<ExportVehicle>,
    #[serde(default)]
    pub checklists: Vec<ExportChecklist>,
    #[serde(default)]
    pub drive_logs: Vec<ExportDriveLog>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportTrailer {
    pub id: EntityId,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub plate: String,
    #[serde(default)]
    pub notes: String,
    /// Base64 image bytes
    #[serde(default)]
    pub photo: Option<String>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportVehicle {
    pub id: EntityId,
    #[serde(default)]
    pub vehicle_type: VehicleType,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub plate: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub photo: Option<String>,
    #[serde(default)]
    pub trailer_id: Option<EntityId>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDriveLog {
    pub id: EntityId,
    pub vehicle_id: Option<EntityId>,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub start_odometer: f64,
    #[serde(default)]
    pub end_odometer: f64,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub checklist_id: Option<EntityId>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportChecklist {
    pub id: EntityId,
    #[serde(default)]
    pub vehicle_type: VehicleType,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub vehicle_id: Option<EntityId>,
    #[serde(default)]
    pub trailer_id: Option<EntityId>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub items: Vec<ExportItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportItem {
    pub id: EntityId,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub section: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub state: ItemState,
    #[serde(default)]
    pub note: Option<String>,
}

/// What an import changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub created: usize,
    pub updated: usize,
    /// Entities whose local copy was as new or newer
    pub unchanged: usize,
    /// Entities skipped because their id is tombstoned
    pub tombstoned: usize,
}

/// Snapshot every live entity in the graph.
pub fn export(graph: &LocalGraph) -> Snapshot {
    Snapshot {
        version: SNAPSHOT_VERSION,
        exported_at: to_datetime(now_millis()),
        trailers: graph.trailers().map(export_trailer).collect(),
        vehicles: graph.vehicles().map(export_vehicle).collect(),
        checklists: graph
            .checklists()
            .map(|checklist| export_checklist(graph, checklist))
            .collect(),
        drive_logs: graph.drive_logs().map(export_drive_log).collect(),
    }
}

pub fn render_json(snapshot: &Snapshot) -> serde_json::Result<String> {
    serde_json::to_string_pretty(snapshot)
}

pub fn parse_json(payload: &str) -> Result<Snapshot> {
    let snapshot: Snapshot = serde_json::from_str(payload)?;
    if snapshot.version > SNAPSHOT_VERSION {
        return Err(Error::InvalidInput(format!(
            "snapshot version {} is newer than supported version {SNAPSHOT_VERSION}",
            snapshot.version
        )));
    }
    Ok(snapshot)
}

#[must_use]
pub fn suggested_export_file_name(timestamp_ms: i64) -> String {
    format!("rigbook-export-{timestamp_ms}.json")
}

/// Merge a snapshot into the graph.
///
/// Relationship targets are resolved against the graph as it stands when
/// each entity is merged (trailers, vehicles, checklists, then drive logs);
/// references to entities that do not exist are dropped. When a snapshot
/// checklist wins, its item list replaces the local one and local items
/// missing from it are deleted. Everything created or replaced is queued
/// for the next push.
pub fn import(graph: &mut LocalGraph, snapshot: &Snapshot) -> Result<ImportSummary> {
    if snapshot.version > SNAPSHOT_VERSION {
        return Err(Error::InvalidInput(format!(
            "snapshot version {} is newer than supported version {SNAPSHOT_VERSION}",
            snapshot.version
        )));
    }

    let tombstoned = graph.tombstoned_ids();
    let mut summary = ImportSummary::default();

    for incoming in &snapshot.trailers {
        let trailer = Trailer {
            id: incoming.id,
            brand: incoming.brand.clone(),
            model: incoming.model.clone(),
            color: incoming.color.clone(),
            plate: incoming.plate.clone(),
            notes: incoming.notes.clone(),
            photo: decode_photo(incoming.photo.as_deref(), &incoming.id)?,
            last_modified: incoming.last_modified.timestamp_millis(),
            needs_push: true,
        };
        merge(graph, &tombstoned, trailer, |t| t.last_modified, &mut summary);
    }

    for incoming in &snapshot.vehicles {
        let vehicle = Vehicle {
            id: incoming.id,
            vehicle_type: incoming.vehicle_type,
            brand: incoming.brand.clone(),
            model: incoming.model.clone(),
            color: incoming.color.clone(),
            plate: incoming.plate.clone(),
            notes: incoming.notes.clone(),
            photo: decode_photo(incoming.photo.as_deref(), &incoming.id)?,
            trailer_id: existing::<Trailer>(graph, incoming.trailer_id),
            last_modified: incoming.last_modified.timestamp_millis(),
            needs_push: true,
        };
        merge(graph, &tombstoned, vehicle, |v| v.last_modified, &mut summary);
    }

    for incoming in &snapshot.checklists {
        let checklist = Checklist {
            id: incoming.id,
            vehicle_type: incoming.vehicle_type,
            title: incoming.title.clone(),
            vehicle_id: existing::<Vehicle>(graph, incoming.vehicle_id),
            trailer_id: existing::<Trailer>(graph, incoming.trailer_id),
            last_modified: incoming.last_modified.timestamp_millis(),
            needs_push: true,
        };
        if merge(graph, &tombstoned, checklist, |c| c.last_modified, &mut summary) {
            replace_items(graph, &tombstoned, incoming, &mut summary);
        }
    }

    for incoming in &snapshot.drive_logs {
        let log = DriveLog {
            id: incoming.id,
            vehicle_id: existing::<Vehicle>(graph, incoming.vehicle_id),
            date: incoming.date.timestamp_millis(),
            reason: incoming.reason.clone(),
            start_odometer: incoming.start_odometer,
            end_odometer: incoming.end_odometer,
            notes: incoming.notes.clone(),
            checklist_id: existing::<Checklist>(graph, incoming.checklist_id),
            last_modified: incoming.last_modified.timestamp_millis(),
            needs_push: true,
        };
        merge(graph, &tombstoned, log, |l| l.last_modified, &mut summary);
    }

    tracing::info!(
        "Imported snapshot: {} created, {} updated, {} unchanged, {} tombstoned",
        summary.created,
        summary.updated,
        summary.unchanged,
        summary.tombstoned
    );
    Ok(summary)
}

/// Insert `incoming` if it is new or strictly newer. Returns whether it
/// was written.
fn merge<E: GraphEntity>(
    graph: &mut LocalGraph,
    tombstoned: &HashSet<EntityId>,
    incoming: E,
    modified: impl Fn(&E) -> i64,
    summary: &mut ImportSummary,
) -> bool {
    let id = incoming.entity_id();
    if tombstoned.contains(&id) {
        summary.tombstoned += 1;
        return false;
    }

    match graph.get::<E>(&id) {
        None => summary.created += 1,
        Some(local) if modified(&incoming) > modified(local) => summary.updated += 1,
        Some(_) => {
            summary.unchanged += 1;
            return false;
        }
    }
    graph.insert(incoming);
    true
}

fn replace_items(
    graph: &mut LocalGraph,
    tombstoned: &HashSet<EntityId>,
    checklist: &ExportChecklist,
    summary: &mut ImportSummary,
) {
    let keep = checklist
        .items
        .iter()
        .map(|item| item.id)
        .collect::<HashSet<_>>();
    let stale = graph
        .items_of(&checklist.id)
        .into_iter()
        .filter(|item| !keep.contains(&item.id))
        .map(|item| item.id)
        .collect::<Vec<_>>();

    let now = now_millis();
    let mut ledger = TombstoneLedger::new(graph);
    for id in stale {
        ledger.delete_cascade(EntityKind::ChecklistItem, id, now);
    }

    for incoming in &checklist.items {
        if tombstoned.contains(&incoming.id) {
            summary.tombstoned += 1;
            continue;
        }
        let item = ChecklistItem {
            id: incoming.id,
            checklist_id: Some(checklist.id),
            position: incoming.position,
            section: incoming.section.clone(),
            title: incoming.title.clone(),
            state: incoming.state,
            note: incoming.note.clone(),
            needs_push: true,
        };
        if graph.get::<ChecklistItem>(&item.id) == Some(&item) {
            continue;
        }
        graph.insert(item);
    }
}

fn existing<E: GraphEntity>(graph: &LocalGraph, id: Option<EntityId>) -> Option<EntityId> {
    id.filter(|id| graph.get::<E>(id).is_some())
}

fn to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn encode_photo(photo: Option<&Vec<u8>>) -> Option<String> {
    photo.map(|bytes| STANDARD.encode(bytes))
}

fn decode_photo(photo: Option<&str>, owner: &EntityId) -> Result<Option<Vec<u8>>> {
    photo
        .map(|encoded| {
            STANDARD.decode(encoded.trim()).map_err(|error| {
                Error::InvalidInput(format!("photo of {owner} is not valid base64: {error}"))
            })
        })
        .transpose()
}

fn export_trailer(trailer: &Trailer) -> ExportTrailer {
    ExportTrailer {
        id: trailer.id,
        brand: trailer.brand.clone(),
        model: trailer.model.clone(),
        color: trailer.color.clone(),
        plate: trailer.plate.clone(),
        notes: trailer.notes.clone(),
        photo: encode_photo(trailer.photo.as_ref()),
        last_modified: to_datetime(trailer.last_modified),
    }
}

fn export_vehicle(vehicle: &Vehicle) -> ExportVehicle {
    ExportVehicle {
        id: vehicle.id,
        vehicle_type: vehicle.vehicle_type,
        brand: vehicle.brand.clone(),
        model: vehicle.model.clone(),
        color: vehicle.color.clone(),
        plate: vehicle.plate.clone(),
        notes: vehicle.notes.clone(),
        photo: encode_photo(vehicle.photo.as_ref()),
        trailer_id: vehicle.trailer_id,
        last_modified: to_datetime(vehicle.last_modified),
    }
}

fn export_checklist(graph: &LocalGraph, checklist: &Checklist) -> ExportChecklist {
    ExportChecklist {
        id: checklist.id,
        vehicle_type: checklist.vehicle_type,
        title: checklist.title.clone(),
        vehicle_id: checklist.vehicle_id,
        trailer_id: checklist.trailer_id,
        last_modified: to_datetime(checklist.last_modified),
        items: graph
            .items_of(&checklist.id)
            .into_iter()
            .map(|item| ExportItem {
                id: item.id,
                position: item.position,
                section: item.section.clone(),
                title: item.title.clone(),
                state: item.state,
                note: item.note.clone(),
            })
            .collect(),
    }
}

fn export_drive_log(log: &DriveLog) -> ExportDriveLog {
    ExportDriveLog {
        id: log.id,
        vehicle_id: log.vehicle_id,
        date: to_datetime(log.date),
        reason: log.reason.clone(),
        start_odometer: log.start_odometer,
        end_odometer: log.end_odometer,
        notes: log.notes.clone(),
        checklist_id: log.checklist_id,
        last_modified: to_datetime(log.last_modified),
    }
}
