//! Rigbook CLI - vehicles, drive logs and checklists from the terminal
//!
//! Local edits land in the replica database; `rigbook sync` exchanges them
//! with the configured remote.

mod cli;
mod commands;
mod error;

#[cfg(test)]
mod tests;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::checklist::run_checklist;
use crate::commands::common::resolve_db_path;
use crate::commands::export::{run_export, run_import};
use crate::commands::log::run_log;
use crate::commands::sync::{run_sync, run_sync_conflicts};
use crate::commands::trailer::run_trailer;
use crate::commands::vehicle::run_vehicle;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rigbook=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Vehicle { command } => run_vehicle(command, &db_path).await?,
        Commands::Trailer { command } => run_trailer(command, &db_path).await?,
        Commands::Log { command } => run_log(command, &db_path).await?,
        Commands::Checklist { command } => run_checklist(command, &db_path).await?,
        Commands::Sync { full, json } => run_sync(full, json, &db_path).await?,
        Commands::Conflicts { limit, json } => run_sync_conflicts(limit, json, &db_path).await?,
        Commands::Export { output } => run_export(output.as_deref(), &db_path).await?,
        Commands::Import { path } => run_import(&path, &db_path).await?,
    }

    Ok(())
}
