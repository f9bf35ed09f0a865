use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use rigbook_core::{ItemState, VehicleType};

#[derive(Parser)]
#[command(name = "rigbook")]
#[command(about = "Vehicles, drive logs and pre-trip checklists, synced across devices")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage vehicles
    Vehicle {
        #[command(subcommand)]
        command: VehicleCommands,
    },
    /// Manage trailers
    Trailer {
        #[command(subcommand)]
        command: TrailerCommands,
    },
    /// Record and list drive logs
    Log {
        #[command(subcommand)]
        command: LogCommands,
    },
    /// Manage pre-trip checklists
    Checklist {
        #[command(subcommand)]
        command: ChecklistCommands,
    },
    /// Run a full sync pass against the configured remote
    Sync {
        /// Push every entity, not only pending ones
        #[arg(long)]
        full: bool,
        /// Output the sync report as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recently resolved sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Export the garage as a JSON snapshot
    Export {
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Merge a JSON snapshot into the garage
    Import {
        /// Snapshot file
        path: PathBuf,
    },
}

/// Descriptive fields shared by vehicles and trailers.
#[derive(Args, Debug, Default)]
pub struct BodyArgs {
    #[arg(long, default_value = "")]
    pub brand: String,
    #[arg(long, default_value = "")]
    pub model: String,
    #[arg(long, default_value = "")]
    pub color: String,
    #[arg(long, default_value = "")]
    pub plate: String,
    #[arg(long, default_value = "")]
    pub notes: String,
    /// Image file to attach
    #[arg(long, value_name = "PATH")]
    pub photo: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum VehicleCommands {
    /// Add a vehicle
    Add {
        /// Vehicle type
        #[arg(long = "type", value_parser = parse_vehicle_type, default_value = "car")]
        vehicle_type: VehicleType,
        #[command(flatten)]
        body: BodyArgs,
    },
    /// List vehicles
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a vehicle with its logs and checklists
    Delete {
        /// Vehicle ID or unique ID prefix
        id: String,
        /// Push the deletion right away
        #[arg(long)]
        push: bool,
    },
    /// Hitch a trailer to a vehicle, or unhitch when no trailer is given
    Link {
        /// Vehicle ID or unique ID prefix
        vehicle: String,
        /// Trailer ID or unique ID prefix
        trailer: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum TrailerCommands {
    /// Add a trailer
    Add {
        #[command(flatten)]
        body: BodyArgs,
    },
    /// List trailers
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a trailer with its checklists
    Delete {
        /// Trailer ID or unique ID prefix
        id: String,
        /// Push the deletion right away
        #[arg(long)]
        push: bool,
    },
}

#[derive(Subcommand)]
pub enum LogCommands {
    /// Record a drive
    Add(LogAddArgs),
    /// List drive logs, newest first
    List {
        /// Only logs of this vehicle
        #[arg(long, value_name = "ID")]
        vehicle: Option<String>,
        /// Number of logs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
pub struct LogAddArgs {
    /// Vehicle ID or unique ID prefix
    pub vehicle: String,
    /// Why the drive happened
    #[arg(long, default_value = "")]
    pub reason: String,
    /// Odometer at departure
    #[arg(long, default_value = "0")]
    pub start: f64,
    /// Odometer at arrival
    #[arg(long, default_value = "0")]
    pub end: f64,
    #[arg(long, default_value = "")]
    pub notes: String,
    /// Date of the drive (RFC 3339 or YYYY-MM-DD, defaults to now)
    #[arg(long)]
    pub date: Option<String>,
    /// Checklist completed before the drive
    #[arg(long, value_name = "ID")]
    pub checklist: Option<String>,
}

#[derive(Subcommand)]
pub enum ChecklistCommands {
    /// Create a checklist
    Add(ChecklistAddArgs),
    /// List checklists with their items
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Set the state of a checklist item
    Check {
        /// Item ID or unique ID prefix
        item: String,
        /// New state
        #[arg(long, value_parser = parse_item_state, default_value = "confirmed")]
        state: ItemState,
        /// Optional note, e.g. why an item was flagged
        #[arg(long)]
        note: Option<String>,
    },
    /// Delete a checklist with its items
    Delete {
        /// Checklist ID or unique ID prefix
        id: String,
        /// Push the deletion right away
        #[arg(long)]
        push: bool,
    },
}

#[derive(Args, Debug)]
pub struct ChecklistAddArgs {
    pub title: String,
    /// Vehicle type the checklist is written for
    #[arg(long = "type", value_parser = parse_vehicle_type, default_value = "car")]
    pub vehicle_type: VehicleType,
    /// Owning vehicle
    #[arg(long, value_name = "ID")]
    pub vehicle: Option<String>,
    /// Owning trailer
    #[arg(long, value_name = "ID")]
    pub trailer: Option<String>,
    /// Item as "Section: Title" (repeatable)
    #[arg(long = "item", value_name = "ITEM")]
    pub items: Vec<String>,
}

pub fn parse_vehicle_type(value: &str) -> Result<VehicleType, String> {
    let value = value.trim();
    VehicleType::ALL
        .into_iter()
        .find(|vehicle_type| vehicle_type.as_str().eq_ignore_ascii_case(value))
        .ok_or_else(|| {
            let known = VehicleType::ALL.map(VehicleType::as_str).join(", ");
            format!("unknown vehicle type '{value}' (expected one of: {known})")
        })
}

pub fn parse_item_state(value: &str) -> Result<ItemState, String> {
    let value = value.trim();
    ItemState::ALL
        .into_iter()
        .find(|state| state.as_str().eq_ignore_ascii_case(value))
        .ok_or_else(|| {
            let known = ItemState::ALL.map(ItemState::as_str).join(", ");
            format!("unknown item state '{value}' (expected one of: {known})")
        })
}
