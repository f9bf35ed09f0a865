//! Shared database service wrapper used by the garage and the sync engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::db::{Database, LibSqlGraphRepository, LocalStore};
use crate::graph::{LocalGraph, PendingChanges};
use crate::models::SyncConflict;
use crate::Result;

/// Thread-safe handle to the local database.
#[derive(Clone)]
pub struct DatabaseService {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl DatabaseService {
    /// Open a database service at the given filesystem path.
    ///
    /// A file that is not a database is moved aside and a fresh one is
    /// created; everything it held is still on the remote.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = match Database::open(&db_path).await {
            Ok(db) => db,
            Err(error) if Self::is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Local database at {} is unreadable: {error}. Starting over.",
                    db_path.display()
                );
                Self::quarantine_corrupted_db_file(&db_path)?;
                Database::open(&db_path).await?
            }
            Err(error) => return Err(error),
        };

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory database service (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Location of the database file, if it has one.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn is_corrupted_db_error(error: &crate::Error) -> bool {
        error
            .to_string()
            .to_ascii_lowercase()
            .contains("file is not a database")
    }

    fn quarantine_corrupted_db_file(db_path: &Path) -> Result<()> {
        if db_path.exists() {
            let timestamp = chrono::Utc::now().timestamp_millis();
            let file_name = db_path
                .file_name()
                .map_or_else(|| "rigbook.db".into(), |name| name.to_string_lossy());
            let backup_path = db_path.with_file_name(format!("{file_name}.corrupt-{timestamp}"));

            std::fs::rename(db_path, &backup_path)?;
            tracing::warn!(
                "Moved corrupted local DB file from {} to {}",
                db_path.display(),
                backup_path.display()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for DatabaseService {
    async fn load_graph(&self) -> Result<LocalGraph> {
        let db = self.db.lock().await;
        LibSqlGraphRepository::new(db.connection()).load_graph().await
    }

    async fn save_changes(&self, graph: &LocalGraph, changes: &PendingChanges) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlGraphRepository::new(db.connection())
            .save_changes(graph, changes)
            .await
    }

    async fn record_conflicts(&self, conflicts: &[SyncConflict]) -> Result<()> {
        if conflicts.is_empty() {
            return Ok(());
        }
        let db = self.db.lock().await;
        LibSqlGraphRepository::new(db.connection())
            .insert_conflicts(conflicts)
            .await
    }

    async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        LibSqlGraphRepository::new(db.connection())
            .list_conflicts(limit)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Trailer, VehicleType, Vehicle};
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn in_memory_save_and_load_roundtrip() {
        let service = DatabaseService::open_in_memory().await.unwrap();
        let mut graph = LocalGraph::new();
        let vehicle = Vehicle::new(VehicleType::Tractor);
        graph.insert(vehicle.clone());

        let changes = graph.take_changes();
        service.save_changes(&graph, &changes).await.unwrap();

        let loaded = service.load_graph().await.unwrap();
        assert_eq!(loaded.get::<Vehicle>(&vehicle.id), Some(&vehicle));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_database_survives_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("rigbook.db");
        let trailer = Trailer::new();

        {
            let service = DatabaseService::open_path(&path).await.unwrap();
            let mut graph = LocalGraph::new();
            graph.insert(trailer.clone());
            let changes = graph.take_changes();
            service.save_changes(&graph, &changes).await.unwrap();
        }

        let service = DatabaseService::open_path(&path).await.unwrap();
        assert_eq!(service.path(), Some(path.as_path()));
        let loaded = service.load_graph().await.unwrap();
        assert_eq!(loaded.get::<Trailer>(&trailer.id), Some(&trailer));
    }

    #[test]
    fn detects_corrupted_database_errors() {
        assert!(DatabaseService::is_corrupted_db_error(
            &crate::Error::Database("SQLite failure: file is not a database".to_string())
        ));
        assert!(!DatabaseService::is_corrupted_db_error(
            &crate::Error::InvalidInput("plate cannot be empty".to_string())
        ));
    }

    #[test]
    fn quarantine_moves_database_aside() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("rigbook.db");
        std::fs::write(&db_path, b"not sqlite").unwrap();

        DatabaseService::quarantine_corrupted_db_file(&db_path).unwrap();

        assert!(!db_path.exists());
        let moved = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .any(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("rigbook.db.corrupt-")
            });
        assert!(moved);
    }
}
