use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rigbook_core::config::RemoteConfig;
use rigbook_core::sync::LibSqlRemoteStore;
use rigbook_core::{
    Checklist, ChecklistItem, DatabaseService, DriveLog, EntityId, EntityKind, GarageService,
    SyncConflict, SyncOptions, Trailer, Vehicle, VehicleType,
};
use serde::Serialize;

use crate::cli::BodyArgs;
use crate::error::CliError;

pub type Garage = GarageService<DatabaseService>;

const ENV_DB_PATH: &str = "RIGBOOK_DB_PATH";

#[derive(Debug, Serialize)]
pub struct VehicleListItem {
    pub id: String,
    pub vehicle_type: String,
    pub name: String,
    pub brand: String,
    pub model: String,
    pub color: String,
    pub plate: String,
    pub notes: String,
    pub has_photo: bool,
    pub trailer_id: Option<String>,
    pub last_modified: i64,
    pub pending: bool,
}

#[derive(Debug, Serialize)]
pub struct TrailerListItem {
    pub id: String,
    pub name: String,
    pub brand: String,
    pub model: String,
    pub color: String,
    pub plate: String,
    pub notes: String,
    pub has_photo: bool,
    pub last_modified: i64,
    pub pending: bool,
}

#[derive(Debug, Serialize)]
pub struct DriveLogListItem {
    pub id: String,
    pub vehicle_id: Option<String>,
    pub date: String,
    pub reason: String,
    pub start_odometer: f64,
    pub end_odometer: f64,
    pub distance: f64,
    pub notes: String,
    pub checklist_id: Option<String>,
    pub pending: bool,
}

#[derive(Debug, Serialize)]
pub struct ChecklistListItem {
    pub id: String,
    pub title: String,
    pub vehicle_type: String,
    pub vehicle_id: Option<String>,
    pub trailer_id: Option<String>,
    pub items: Vec<ChecklistItemEntry>,
    pub pending: bool,
}

#[derive(Debug, Serialize)]
pub struct ChecklistItemEntry {
    pub id: String,
    pub section: String,
    pub title: String,
    pub state: String,
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SyncConflictItem {
    pub id: i64,
    pub entity_kind: String,
    pub entity_id: String,
    pub local_modified: i64,
    pub remote_modified: i64,
    pub resolved_at: i64,
    pub resolved_at_iso: String,
    pub winner: String,
    pub strategy: String,
}

pub async fn open_garage(db_path: &Path) -> Result<Garage, CliError> {
    let store = DatabaseService::open_path(db_path).await?;
    Ok(GarageService::open(store).await?)
}

/// Remote store from `RIGBOOK_REMOTE_*`, or [`CliError::SyncNotConfigured`].
pub async fn open_remote() -> Result<Arc<LibSqlRemoteStore>, CliError> {
    let Some(config) = RemoteConfig::from_env()? else {
        return Err(CliError::SyncNotConfigured);
    };
    tracing::info!("Using remote store {config:?}");
    Ok(Arc::new(LibSqlRemoteStore::connect(&config).await?))
}

pub fn sync_options(full: bool) -> Result<SyncOptions, CliError> {
    Ok(SyncOptions::from_env()?.with_full_push(full))
}

pub fn normalize_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyId)
    } else {
        Ok(trimmed.to_string())
    }
}

pub async fn resolve(garage: &Garage, kind: EntityKind, id: &str) -> Result<EntityId, CliError> {
    let normalized = normalize_identifier(id)?;
    Ok(garage.resolve_id(kind, &normalized).await?)
}

pub async fn resolve_optional(
    garage: &Garage,
    kind: EntityKind,
    id: Option<&str>,
) -> Result<Option<EntityId>, CliError> {
    match id {
        Some(id) => resolve(garage, kind, id).await.map(Some),
        None => Ok(None),
    }
}

/// Delete an entity and its dependents; with `push`, wait for the
/// tombstones to reach the remote.
pub async fn delete_entity(
    garage: &Garage,
    kind: EntityKind,
    id: &str,
    push: bool,
) -> Result<(), CliError> {
    let id = resolve(garage, kind, id).await?;
    let remote = if push { Some(open_remote().await?) } else { None };

    let keys = garage.delete(kind, id).await?;
    println!("{id}");
    if keys.len() > 1 {
        println!("Removed {} dependent records", keys.len() - 1);
    }

    if let Some(remote) = remote {
        let engine = garage.sync_engine(remote, sync_options(false)?);
        let report = engine.spawn_tombstone_push().await?;
        for error in &report.errors {
            eprintln!("Warning: {error}");
        }
        println!("Pushed {} tombstones", report.tombstones_pushed);
    }
    Ok(())
}

pub fn vehicle_from_args(vehicle_type: VehicleType, body: BodyArgs) -> Result<Vehicle, CliError> {
    let mut vehicle = Vehicle::new(vehicle_type);
    vehicle.photo = read_photo(body.photo.as_deref())?;
    vehicle.brand = body.brand.trim().to_string();
    vehicle.model = body.model.trim().to_string();
    vehicle.color = body.color.trim().to_string();
    vehicle.plate = body.plate.trim().to_string();
    vehicle.notes = body.notes.trim().to_string();
    Ok(vehicle)
}

pub fn trailer_from_args(body: BodyArgs) -> Result<Trailer, CliError> {
    let mut trailer = Trailer::new();
    trailer.photo = read_photo(body.photo.as_deref())?;
    trailer.brand = body.brand.trim().to_string();
    trailer.model = body.model.trim().to_string();
    trailer.color = body.color.trim().to_string();
    trailer.plate = body.plate.trim().to_string();
    trailer.notes = body.notes.trim().to_string();
    Ok(trailer)
}

fn read_photo(path: Option<&Path>) -> Result<Option<Vec<u8>>, CliError> {
    Ok(path.map(std::fs::read).transpose()?)
}

/// Parse an RFC 3339 timestamp or a plain date (midnight UTC).
pub fn parse_drive_date(value: &str) -> Result<i64, CliError> {
    let trimmed = value.trim();
    if let Ok(date_time) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(date_time.timestamp_millis());
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|date_time| date_time.and_utc().timestamp_millis())
        .ok_or_else(|| CliError::InvalidDate(value.to_string()))
}

/// Split "Section: Title"; a bare title goes in the "General" section.
pub fn parse_item_spec(spec: &str) -> Result<(String, String), CliError> {
    let (section, title) = match spec.split_once(':') {
        Some((section, title)) => (section.trim(), title.trim()),
        None => ("General", spec.trim()),
    };
    if title.is_empty() || section.is_empty() {
        return Err(CliError::InvalidItem(spec.to_string()));
    }
    Ok((section.to_string(), title.to_string()))
}

pub fn vehicle_to_list_item(vehicle: &Vehicle) -> VehicleListItem {
    VehicleListItem {
        id: vehicle.id.to_string(),
        vehicle_type: vehicle.vehicle_type.to_string(),
        name: vehicle.display_name(),
        brand: vehicle.brand.clone(),
        model: vehicle.model.clone(),
        color: vehicle.color.clone(),
        plate: vehicle.plate.clone(),
        notes: vehicle.notes.clone(),
        has_photo: vehicle.photo.is_some(),
        trailer_id: vehicle.trailer_id.map(|id| id.to_string()),
        last_modified: vehicle.last_modified,
        pending: vehicle.needs_push,
    }
}

pub fn trailer_to_list_item(trailer: &Trailer) -> TrailerListItem {
    TrailerListItem {
        id: trailer.id.to_string(),
        name: trailer.display_name(),
        brand: trailer.brand.clone(),
        model: trailer.model.clone(),
        color: trailer.color.clone(),
        plate: trailer.plate.clone(),
        notes: trailer.notes.clone(),
        has_photo: trailer.photo.is_some(),
        last_modified: trailer.last_modified,
        pending: trailer.needs_push,
    }
}

pub fn drive_log_to_list_item(log: &DriveLog) -> DriveLogListItem {
    DriveLogListItem {
        id: log.id.to_string(),
        vehicle_id: log.vehicle_id.map(|id| id.to_string()),
        date: format_iso(log.date),
        reason: log.reason.clone(),
        start_odometer: log.start_odometer,
        end_odometer: log.end_odometer,
        distance: log.end_odometer - log.start_odometer,
        notes: log.notes.clone(),
        checklist_id: log.checklist_id.map(|id| id.to_string()),
        pending: log.needs_push,
    }
}

pub fn checklist_to_list_item(checklist: &Checklist, items: &[ChecklistItem]) -> ChecklistListItem {
    ChecklistListItem {
        id: checklist.id.to_string(),
        title: checklist.title.clone(),
        vehicle_type: checklist.vehicle_type.to_string(),
        vehicle_id: checklist.vehicle_id.map(|id| id.to_string()),
        trailer_id: checklist.trailer_id.map(|id| id.to_string()),
        items: items
            .iter()
            .map(|item| ChecklistItemEntry {
                id: item.id.to_string(),
                section: item.section.clone(),
                title: item.title.clone(),
                state: item.state.to_string(),
                note: item.note.clone(),
            })
            .collect(),
        pending: checklist.needs_push,
    }
}

pub fn sync_conflict_to_item(conflict: &SyncConflict) -> SyncConflictItem {
    SyncConflictItem {
        id: conflict.id,
        entity_kind: conflict.entity_kind.to_string(),
        entity_id: conflict.entity_id.clone(),
        local_modified: conflict.local_modified,
        remote_modified: conflict.remote_modified,
        resolved_at: conflict.resolved_at,
        resolved_at_iso: format_sync_timestamp(conflict.resolved_at),
        winner: conflict.winner.to_string(),
        strategy: conflict.strategy.clone(),
    }
}

pub fn format_vehicle_lines(vehicles: &[Vehicle]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    vehicles
        .iter()
        .map(|vehicle| {
            let relative_time = format_relative_time(vehicle.last_modified, now_ms);
            let line = format!(
                "{}  {:<10}  {:<32}  {relative_time}",
                vehicle.id,
                vehicle.vehicle_type.as_str(),
                vehicle.display_name()
            );
            match vehicle.trailer_id {
                Some(trailer_id) => format!("{line}  trailer={}", short_id(&trailer_id)),
                None => line,
            }
        })
        .collect()
}

pub fn format_trailer_lines(trailers: &[Trailer]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    trailers
        .iter()
        .map(|trailer| {
            format!(
                "{}  {:<32}  {}",
                trailer.id,
                trailer.display_name(),
                format_relative_time(trailer.last_modified, now_ms)
            )
        })
        .collect()
}

pub fn format_drive_log_lines(logs: &[DriveLog]) -> Vec<String> {
    logs.iter()
        .map(|log| {
            let date = DateTime::from_timestamp_millis(log.date).map_or_else(
                || log.date.to_string(),
                |date_time| date_time.format("%Y-%m-%d").to_string(),
            );
            format!(
                "{}  {date}  {:>9.1} km  {}",
                log.id,
                log.end_odometer - log.start_odometer,
                log.reason
            )
        })
        .collect()
}

pub fn format_checklist_lines(checklist: &Checklist, items: &[ChecklistItem]) -> Vec<String> {
    let mut lines = vec![format!(
        "{}  {} ({})",
        checklist.id, checklist.title, checklist.vehicle_type
    )];
    let mut section = None;
    for item in items {
        if section != Some(item.section.as_str()) {
            section = Some(item.section.as_str());
            lines.push(format!("  {}", item.section));
        }
        let line = format!("    {} {}  {}", item.state.marker(), item.title, item.id);
        match item.note.as_deref() {
            Some(note) => lines.push(format!("{line}  ({note})")),
            None => lines.push(line),
        }
    }
    lines
}

pub fn format_sync_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {:<4}  {:<13} {}  winner={}  local={} remote={}",
                format_sync_timestamp(conflict.resolved_at),
                conflict.strategy,
                conflict.entity_kind.type_tag(),
                conflict.entity_id,
                conflict.winner,
                conflict.local_modified,
                conflict.remote_modified
            )
        })
        .collect()
}

pub fn short_id(id: &EntityId) -> String {
    id.to_string().chars().take(13).collect()
}

pub fn format_iso(timestamp_ms: i64) -> String {
    DateTime::from_timestamp_millis(timestamp_ms)
        .map_or_else(|| timestamp_ms.to_string(), |date_time| date_time.to_rfc3339())
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os(ENV_DB_PATH).map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rigbook")
        .join("rigbook.db")
}
