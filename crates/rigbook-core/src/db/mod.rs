//! Database layer for Rigbook

mod connection;
mod migrations;
mod repository;

use async_trait::async_trait;

use crate::error::Result;
use crate::graph::{LocalGraph, PendingChanges};
use crate::models::SyncConflict;

pub use connection::Database;
pub use repository::LibSqlGraphRepository;

/// Durable storage behind the local graph.
///
/// Identity is the entity id, stable across restarts. `save_changes` must
/// apply every pending mutation atomically.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn load_graph(&self) -> Result<LocalGraph>;

    async fn save_changes(&self, graph: &LocalGraph, changes: &PendingChanges) -> Result<()>;

    async fn record_conflicts(&self, conflicts: &[SyncConflict]) -> Result<()>;

    async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>>;
}
