//! Remote store backed by a libSQL database.
//!
//! Works against a shared database file or a hosted libSQL/Turso database.
//! Each record is one row; its fields are stored as JSON with assets
//! base64-encoded.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use libsql::{Builder, Connection};
use tokio::sync::Mutex;

use crate::config::RemoteConfig;
use crate::util::compact_text;

use super::record::{FieldValue, Record, RecordId, SavePolicy};
use super::remote::{
    BatchOutcome, RecordError, RecordFailure, RemoteStore, TransportError, DEFAULT_BATCH_LIMIT,
};

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS zones (
        name TEXT PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS records (
        zone TEXT NOT NULL,
        record_id TEXT NOT NULL,
        record_type TEXT NOT NULL,
        fields TEXT NOT NULL,
        PRIMARY KEY (zone, record_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_records_type ON records(zone, record_type)",
];

pub struct LibSqlRemoteStore {
    _db: libsql::Database,
    conn: Mutex<Connection>,
    batch_limit: usize,
}

impl LibSqlRemoteStore {
    pub async fn connect(config: &RemoteConfig) -> Result<Self, TransportError> {
        match config {
            RemoteConfig::Hosted { url, token } => Self::open_remote(url, token).await,
            RemoteConfig::File { path } => Self::open_local(path).await,
        }
    }

    /// Open (or create) a shared database file.
    pub async fn open_local(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let db = Builder::new_local(&path_str)
            .build()
            .await
            .map_err(unavailable)?;
        Self::build(db).await
    }

    /// Connect to a hosted libSQL database.
    pub async fn open_remote(url: &str, token: &str) -> Result<Self, TransportError> {
        let db = Builder::new_remote(url.to_string(), token.to_string())
            .build()
            .await
            .map_err(unavailable)?;
        Self::build(db).await
    }

    pub async fn in_memory() -> Result<Self, TransportError> {
        let db = Builder::new_local(":memory:")
            .build()
            .await
            .map_err(unavailable)?;
        Self::build(db).await
    }

    #[must_use]
    pub const fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    async fn build(db: libsql::Database) -> Result<Self, TransportError> {
        let conn = db.connect().map_err(unavailable)?;
        for statement in SCHEMA {
            conn.execute(statement, ()).await.map_err(unavailable)?;
        }
        Ok(Self {
            _db: db,
            conn: Mutex::new(conn),
            batch_limit: DEFAULT_BATCH_LIMIT,
        })
    }

    fn check_limit(&self, size: usize) -> Result<(), TransportError> {
        if size > self.batch_limit {
            return Err(TransportError::LimitExceeded {
                size,
                limit: self.batch_limit,
            });
        }
        Ok(())
    }
}

fn unavailable(error: libsql::Error) -> TransportError {
    TransportError::Unavailable(compact_text(&error.to_string()))
}

async fn ensure_zone(conn: &Connection, zone: &str) -> Result<(), TransportError> {
    let mut rows = conn
        .query("SELECT 1 FROM zones WHERE name = ?", [zone])
        .await
        .map_err(unavailable)?;
    match rows.next().await.map_err(unavailable)? {
        Some(_) => Ok(()),
        None => Err(TransportError::ZoneNotFound(zone.to_string())),
    }
}

async fn load_fields(
    conn: &Connection,
    zone: &str,
    id: &RecordId,
) -> Result<Option<BTreeMap<String, FieldValue>>, TransportError> {
    let mut rows = conn
        .query(
            "SELECT fields FROM records WHERE zone = ? AND record_id = ?",
            [zone, id.as_str()],
        )
        .await
        .map_err(unavailable)?;
    let Some(row) = rows.next().await.map_err(unavailable)? else {
        return Ok(None);
    };
    let json = row.get::<String>(0).map_err(unavailable)?;
    serde_json::from_str(&json)
        .map(Some)
        .map_err(|error| TransportError::Rejected(format!("stored record {id} is corrupt: {error}")))
}

async fn store(conn: &Connection, zone: &str, record: &Record) -> Result<(), RecordError> {
    let fields = serde_json::to_string(&record.fields)
        .map_err(|error| RecordError::Rejected(error.to_string()))?;
    conn.execute(
        "INSERT OR REPLACE INTO records (zone, record_id, record_type, fields)
         VALUES (?, ?, ?, ?)",
        [
            zone,
            record.record_id.as_str(),
            record.record_type.as_str(),
            fields.as_str(),
        ],
    )
    .await
    .map_err(|error| RecordError::Rejected(error.to_string()))?;
    Ok(())
}

#[async_trait]
impl RemoteStore for LibSqlRemoteStore {
    fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    async fn create_zone(&self, zone: &str) -> Result<(), TransportError> {
        let conn = self.conn.lock().await;
        conn.execute("INSERT OR IGNORE INTO zones (name) VALUES (?)", [zone])
            .await
            .map_err(unavailable)?;
        tracing::info!("Provisioned remote zone {zone}");
        Ok(())
    }

    async fn query(&self, zone: &str, record_type: &str) -> Result<Vec<Record>, TransportError> {
        let conn = self.conn.lock().await;
        ensure_zone(&conn, zone).await?;

        let mut rows = conn
            .query(
                "SELECT record_id, fields FROM records
                 WHERE zone = ? AND record_type = ?
                 ORDER BY record_id",
                [zone, record_type],
            )
            .await
            .map_err(unavailable)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(unavailable)? {
            let record_id = row.get::<String>(0).map_err(unavailable)?;
            let json = row.get::<String>(1).map_err(unavailable)?;
            match serde_json::from_str(&json) {
                Ok(fields) => records.push(Record {
                    record_type: record_type.to_string(),
                    record_id: RecordId::from(record_id.as_str()),
                    fields,
                }),
                Err(error) => {
                    tracing::warn!("Skipping unreadable remote record {record_id}: {error}");
                }
            }
        }
        Ok(records)
    }

    async fn save(
        &self,
        zone: &str,
        records: &[Record],
        policy: SavePolicy,
    ) -> Result<BatchOutcome, TransportError> {
        self.check_limit(records.len())?;
        let conn = self.conn.lock().await;
        ensure_zone(&conn, zone).await?;

        let mut outcome = BatchOutcome::default();
        for record in records {
            let next = match policy {
                SavePolicy::ChangedKeys => {
                    match load_fields(&conn, zone, &record.record_id).await? {
                        Some(fields) => {
                            let mut merged = Record {
                                record_type: record.record_type.clone(),
                                record_id: record.record_id.clone(),
                                fields,
                            };
                            merged.apply_changes(record);
                            merged
                        }
                        None => record.clone().without_nulls(),
                    }
                }
                SavePolicy::AllKeys => record.clone().without_nulls(),
            };

            match store(&conn, zone, &next).await {
                Ok(()) => outcome.saved.push(record.record_id.clone()),
                Err(error) => outcome.failed.push(RecordFailure {
                    record_id: record.record_id.clone(),
                    error,
                }),
            }
        }
        Ok(outcome)
    }

    async fn delete(&self, zone: &str, ids: &[RecordId]) -> Result<BatchOutcome, TransportError> {
        self.check_limit(ids.len())?;
        let conn = self.conn.lock().await;
        ensure_zone(&conn, zone).await?;

        let mut outcome = BatchOutcome::default();
        for id in ids {
            let deleted = conn
                .execute(
                    "DELETE FROM records WHERE zone = ? AND record_id = ?",
                    [zone, id.as_str()],
                )
                .await;
            match deleted {
                Ok(0) => outcome.failed.push(RecordFailure {
                    record_id: id.clone(),
                    error: RecordError::NotFound,
                }),
                Ok(_) => outcome.saved.push(id.clone()),
                Err(error) => outcome.failed.push(RecordFailure {
                    record_id: id.clone(),
                    error: RecordError::Rejected(error.to_string()),
                }),
            }
        }
        Ok(outcome)
    }
}
