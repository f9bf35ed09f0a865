//! Long-lived handles shared by the CLI and tests.

mod database;
mod garage;

pub use database::DatabaseService;
pub use garage::GarageService;
