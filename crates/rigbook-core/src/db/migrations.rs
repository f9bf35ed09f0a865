//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Run `statements` in one transaction.
async fn apply(conn: &Connection, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }
    Ok(())
}

/// Migration to version 1: entity tables and tombstones
///
/// Relationship columns carry plain ids without foreign keys; a reference
/// to an entity this replica does not hold is legal.
async fn migrate_v1(conn: &Connection) -> Result<()> {
    apply(
        conn,
        &[
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            "CREATE TABLE IF NOT EXISTS trailers (
                id TEXT PRIMARY KEY,
                brand TEXT NOT NULL DEFAULT '',
                model TEXT NOT NULL DEFAULT '',
                color TEXT NOT NULL DEFAULT '',
                plate TEXT NOT NULL DEFAULT '',
                notes TEXT NOT NULL DEFAULT '',
                photo BLOB,
                last_modified INTEGER NOT NULL,
                needs_push INTEGER NOT NULL DEFAULT 1
            )",
            "CREATE TABLE IF NOT EXISTS vehicles (
                id TEXT PRIMARY KEY,
                vehicle_type TEXT NOT NULL,
                brand TEXT NOT NULL DEFAULT '',
                model TEXT NOT NULL DEFAULT '',
                color TEXT NOT NULL DEFAULT '',
                plate TEXT NOT NULL DEFAULT '',
                notes TEXT NOT NULL DEFAULT '',
                photo BLOB,
                trailer_id TEXT,
                last_modified INTEGER NOT NULL,
                needs_push INTEGER NOT NULL DEFAULT 1
            )",
            "CREATE TABLE IF NOT EXISTS checklists (
                id TEXT PRIMARY KEY,
                vehicle_type TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                vehicle_id TEXT,
                trailer_id TEXT,
                last_modified INTEGER NOT NULL,
                needs_push INTEGER NOT NULL DEFAULT 1
            )",
            "CREATE TABLE IF NOT EXISTS drive_logs (
                id TEXT PRIMARY KEY,
                vehicle_id TEXT,
                date INTEGER NOT NULL,
                reason TEXT NOT NULL DEFAULT '',
                start_odometer REAL NOT NULL DEFAULT 0,
                end_odometer REAL NOT NULL DEFAULT 0,
                notes TEXT NOT NULL DEFAULT '',
                checklist_id TEXT,
                last_modified INTEGER NOT NULL,
                needs_push INTEGER NOT NULL DEFAULT 1
            )",
            "CREATE INDEX IF NOT EXISTS idx_drive_logs_vehicle ON drive_logs(vehicle_id, date DESC)",
            "CREATE TABLE IF NOT EXISTS checklist_items (
                id TEXT PRIMARY KEY,
                checklist_id TEXT,
                position INTEGER NOT NULL DEFAULT 0,
                section TEXT NOT NULL DEFAULT '',
                title TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL DEFAULT 'unset',
                note TEXT,
                needs_push INTEGER NOT NULL DEFAULT 1
            )",
            "CREATE INDEX IF NOT EXISTS idx_checklist_items_checklist ON checklist_items(checklist_id, position)",
            "CREATE TABLE IF NOT EXISTS tombstones (
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                deleted_at INTEGER NOT NULL,
                pushed INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (entity_type, entity_id)
            )",
            "INSERT INTO schema_version (version) VALUES (1)",
        ],
    )
    .await?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: LWW conflict log
async fn migrate_v2(conn: &Connection) -> Result<()> {
    apply(
        conn,
        &[
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                local_modified INTEGER NOT NULL,
                remote_modified INTEGER NOT NULL,
                resolved_at INTEGER NOT NULL,
                winner TEXT NOT NULL,
                strategy TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_entity ON sync_conflicts(entity_id)",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at ON sync_conflicts(resolved_at DESC)",
            "INSERT INTO schema_version (version) VALUES (2)",
        ],
    )
    .await?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}
