//! rigbook-core - Core library for Rigbook
//!
//! This crate contains the models, the durable local store, and the
//! multi-device sync engine shared by every Rigbook interface.

pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod graph;
pub mod models;
pub mod services;
pub mod sync;
pub mod util;

pub use config::{RemoteConfig, SyncOptions};
pub use error::{Error, Result};
pub use graph::LocalGraph;
pub use models::{
    Checklist, ChecklistItem, DriveLog, EntityId, EntityKind, ItemState, SyncConflict, Tombstone,
    Trailer, Vehicle, VehicleType,
};
pub use services::{DatabaseService, GarageService};
pub use sync::{SyncEngine, SyncReport};
