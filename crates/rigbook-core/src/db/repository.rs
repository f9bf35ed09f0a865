//! Local graph persistence

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use libsql::{params, Connection, Row};

use crate::error::{Error, Result};
use crate::graph::{LocalGraph, PendingChanges};
use crate::models::{
    Checklist, ChecklistItem, ConflictWinner, DriveLog, EntityId, EntityKind, ItemState,
    SyncConflict, Tombstone, Trailer, Vehicle, VehicleType,
};

/// libSQL persistence for the local graph, tombstones and the conflict log.
pub struct LibSqlGraphRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlGraphRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Load every entity and tombstone into a fresh graph with no pending changes.
    pub async fn load_graph(&self) -> Result<LocalGraph> {
        let mut graph = LocalGraph::new();

        let mut rows = self
            .conn
            .query(
                "SELECT id, brand, model, color, plate, notes, photo, last_modified, needs_push
                 FROM trailers",
                (),
            )
            .await?;
        while let Some(row) = rows.next().await? {
            graph.load(Trailer {
                id: parse_id(&row.get::<String>(0)?)?,
                brand: row.get(1)?,
                model: row.get(2)?,
                color: row.get(3)?,
                plate: row.get(4)?,
                notes: row.get(5)?,
                photo: row.get(6)?,
                last_modified: row.get(7)?,
                needs_push: flag(&row, 8)?,
            });
        }

        let mut rows = self
            .conn
            .query(
                "SELECT id, vehicle_type, brand, model, color, plate, notes, photo, trailer_id,
                        last_modified, needs_push
                 FROM vehicles",
                (),
            )
            .await?;
        while let Some(row) = rows.next().await? {
            graph.load(Vehicle {
                id: parse_id(&row.get::<String>(0)?)?,
                vehicle_type: VehicleType::parse_lenient(&row.get::<String>(1)?),
                brand: row.get(2)?,
                model: row.get(3)?,
                color: row.get(4)?,
                plate: row.get(5)?,
                notes: row.get(6)?,
                photo: row.get(7)?,
                trailer_id: optional_id(&row, 8)?,
                last_modified: row.get(9)?,
                needs_push: flag(&row, 10)?,
            });
        }

        let mut rows = self
            .conn
            .query(
                "SELECT id, vehicle_type, title, vehicle_id, trailer_id, last_modified, needs_push
                 FROM checklists",
                (),
            )
            .await?;
        while let Some(row) = rows.next().await? {
            graph.load(Checklist {
                id: parse_id(&row.get::<String>(0)?)?,
                vehicle_type: VehicleType::parse_lenient(&row.get::<String>(1)?),
                title: row.get(2)?,
                vehicle_id: optional_id(&row, 3)?,
                trailer_id: optional_id(&row, 4)?,
                last_modified: row.get(5)?,
                needs_push: flag(&row, 6)?,
            });
        }

        let mut rows = self
            .conn
            .query(
                "SELECT id, vehicle_id, date, reason, start_odometer, end_odometer, notes,
                        checklist_id, last_modified, needs_push
                 FROM drive_logs",
                (),
            )
            .await?;
        while let Some(row) = rows.next().await? {
            graph.load(DriveLog {
                id: parse_id(&row.get::<String>(0)?)?,
                vehicle_id: optional_id(&row, 1)?,
                date: row.get(2)?,
                reason: row.get(3)?,
                start_odometer: row.get(4)?,
                end_odometer: row.get(5)?,
                notes: row.get(6)?,
                checklist_id: optional_id(&row, 7)?,
                last_modified: row.get(8)?,
                needs_push: flag(&row, 9)?,
            });
        }

        let mut rows = self
            .conn
            .query(
                "SELECT id, checklist_id, position, section, title, state, note, needs_push
                 FROM checklist_items",
                (),
            )
            .await?;
        while let Some(row) = rows.next().await? {
            graph.load(ChecklistItem {
                id: parse_id(&row.get::<String>(0)?)?,
                checklist_id: optional_id(&row, 1)?,
                position: row.get(2)?,
                section: row.get(3)?,
                title: row.get(4)?,
                state: ItemState::parse_lenient(&row.get::<String>(5)?),
                note: row.get(6)?,
                needs_push: flag(&row, 7)?,
            });
        }

        let mut rows = self
            .conn
            .query(
                "SELECT entity_type, entity_id, deleted_at, pushed FROM tombstones",
                (),
            )
            .await?;
        while let Some(row) = rows.next().await? {
            let tag = row.get::<String>(0)?;
            let Some(kind) = EntityKind::from_type_tag(&tag) else {
                tracing::warn!("Skipping tombstone with unknown entity type {tag}");
                continue;
            };
            graph.load_tombstone(Tombstone {
                kind,
                entity_id: parse_id(&row.get::<String>(1)?)?,
                deleted_at: row.get(2)?,
                pushed: flag(&row, 3)?,
            });
        }

        Ok(graph)
    }

    /// Write `changes` in a single transaction.
    pub async fn save_changes(&self, graph: &LocalGraph, changes: &PendingChanges) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        self.conn.execute("BEGIN TRANSACTION", ()).await?;

        if let Err(e) = self.write_changes(graph, changes).await {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(e);
        }

        if let Err(e) = self.conn.execute("COMMIT", ()).await {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }

        tracing::debug!(
            "Persisted {} upserts, {} removals, {} tombstones",
            changes.upserted.len(),
            changes.removed.len(),
            changes.tombstones.len()
        );
        Ok(())
    }

    async fn write_changes(&self, graph: &LocalGraph, changes: &PendingChanges) -> Result<()> {
        for (kind, id) in &changes.removed {
            self.delete_row(*kind, id).await?;
        }
        for (kind, id) in &changes.upserted {
            self.upsert_row(graph, *kind, id).await?;
        }
        for (kind, id) in &changes.tombstones {
            if let Some(tombstone) = graph.tombstone(*kind, id) {
                self.conn
                    .execute(
                        "INSERT OR REPLACE INTO tombstones (entity_type, entity_id, deleted_at, pushed)
                         VALUES (?, ?, ?, ?)",
                        params![
                            kind.type_tag(),
                            id.to_string(),
                            tombstone.deleted_at,
                            i64::from(tombstone.pushed)
                        ],
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn delete_row(&self, kind: EntityKind, id: &EntityId) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE id = ?", table_name(kind));
        self.conn.execute(&sql, params![id.to_string()]).await?;
        Ok(())
    }

    async fn upsert_row(&self, graph: &LocalGraph, kind: EntityKind, id: &EntityId) -> Result<()> {
        let written = match kind {
            EntityKind::Trailer => match graph.get::<Trailer>(id) {
                Some(trailer) => self.upsert_trailer(trailer).await.map(|()| true),
                None => Ok(false),
            },
            EntityKind::Vehicle => match graph.get::<Vehicle>(id) {
                Some(vehicle) => self.upsert_vehicle(vehicle).await.map(|()| true),
                None => Ok(false),
            },
            EntityKind::Checklist => match graph.get::<Checklist>(id) {
                Some(checklist) => self.upsert_checklist(checklist).await.map(|()| true),
                None => Ok(false),
            },
            EntityKind::DriveLog => match graph.get::<DriveLog>(id) {
                Some(log) => self.upsert_drive_log(log).await.map(|()| true),
                None => Ok(false),
            },
            EntityKind::ChecklistItem => match graph.get::<ChecklistItem>(id) {
                Some(item) => self.upsert_item(item).await.map(|()| true),
                None => Ok(false),
            },
        }?;

        if !written {
            self.delete_row(kind, id).await?;
        }
        Ok(())
    }

    async fn upsert_trailer(&self, trailer: &Trailer) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO trailers
                 (id, brand, model, color, plate, notes, photo, last_modified, needs_push)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    trailer.id.to_string(),
                    trailer.brand.as_str(),
                    trailer.model.as_str(),
                    trailer.color.as_str(),
                    trailer.plate.as_str(),
                    trailer.notes.as_str(),
                    trailer.photo.clone(),
                    trailer.last_modified,
                    i64::from(trailer.needs_push)
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_vehicle(&self, vehicle: &Vehicle) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO vehicles
                 (id, vehicle_type, brand, model, color, plate, notes, photo, trailer_id,
                  last_modified, needs_push)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    vehicle.id.to_string(),
                    vehicle.vehicle_type.as_str(),
                    vehicle.brand.as_str(),
                    vehicle.model.as_str(),
                    vehicle.color.as_str(),
                    vehicle.plate.as_str(),
                    vehicle.notes.as_str(),
                    vehicle.photo.clone(),
                    id_text(vehicle.trailer_id),
                    vehicle.last_modified,
                    i64::from(vehicle.needs_push)
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_checklist(&self, checklist: &Checklist) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO checklists
                 (id, vehicle_type, title, vehicle_id, trailer_id, last_modified, needs_push)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    checklist.id.to_string(),
                    checklist.vehicle_type.as_str(),
                    checklist.title.as_str(),
                    id_text(checklist.vehicle_id),
                    id_text(checklist.trailer_id),
                    checklist.last_modified,
                    i64::from(checklist.needs_push)
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_drive_log(&self, log: &DriveLog) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO drive_logs
                 (id, vehicle_id, date, reason, start_odometer, end_odometer, notes,
                  checklist_id, last_modified, needs_push)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    log.id.to_string(),
                    id_text(log.vehicle_id),
                    log.date,
                    log.reason.as_str(),
                    log.start_odometer,
                    log.end_odometer,
                    log.notes.as_str(),
                    id_text(log.checklist_id),
                    log.last_modified,
                    i64::from(log.needs_push)
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_item(&self, item: &ChecklistItem) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO checklist_items
                 (id, checklist_id, position, section, title, state, note, needs_push)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    item.id.to_string(),
                    id_text(item.checklist_id),
                    item.position,
                    item.section.as_str(),
                    item.title.as_str(),
                    item.state.as_str(),
                    item.note.clone(),
                    i64::from(item.needs_push)
                ],
            )
            .await?;
        Ok(())
    }

    /// Append resolved conflicts to the log.
    pub async fn insert_conflicts(&self, conflicts: &[SyncConflict]) -> Result<()> {
        for conflict in conflicts {
            self.conn
                .execute(
                    "INSERT INTO sync_conflicts
                     (entity_type, entity_id, local_modified, remote_modified, resolved_at,
                      winner, strategy)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                    params![
                        conflict.entity_kind.type_tag(),
                        conflict.entity_id.as_str(),
                        conflict.local_modified,
                        conflict.remote_modified,
                        conflict.resolved_at,
                        conflict.winner.as_str(),
                        conflict.strategy.as_str()
                    ],
                )
                .await?;
        }
        Ok(())
    }

    /// Most recent conflicts first.
    pub async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, entity_type, entity_id, local_modified, remote_modified, resolved_at,
                        winner, strategy
                 FROM sync_conflicts
                 ORDER BY resolved_at DESC, id DESC
                 LIMIT ?",
                params![limit as i64],
            )
            .await?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            let tag = row.get::<String>(1)?;
            let entity_kind = EntityKind::from_type_tag(&tag)
                .ok_or_else(|| Error::Database(format!("Unknown entity type in conflict log: {tag}")))?;
            conflicts.push(SyncConflict {
                id: row.get(0)?,
                entity_kind,
                entity_id: row.get(2)?,
                local_modified: row.get(3)?,
                remote_modified: row.get(4)?,
                resolved_at: row.get(5)?,
                winner: ConflictWinner::parse_lenient(&row.get::<String>(6)?),
                strategy: row.get(7)?,
            });
        }
        Ok(conflicts)
    }
}

const fn table_name(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Trailer => "trailers",
        EntityKind::Vehicle => "vehicles",
        EntityKind::Checklist => "checklists",
        EntityKind::DriveLog => "drive_logs",
        EntityKind::ChecklistItem => "checklist_items",
    }
}

fn parse_id(value: &str) -> Result<EntityId> {
    value
        .parse()
        .map_err(|error| Error::Database(format!("Invalid entity id {value}: {error}")))
}

fn optional_id(row: &Row, index: i32) -> Result<Option<EntityId>> {
    Ok(row
        .get::<Option<String>>(index)?
        .and_then(|value| value.parse().ok()))
}

fn flag(row: &Row, index: i32) -> Result<bool> {
    Ok(row.get::<i64>(index)? != 0)
}

fn id_text(id: Option<EntityId>) -> Option<String> {
    id.map(|id| id.to_string())
}
