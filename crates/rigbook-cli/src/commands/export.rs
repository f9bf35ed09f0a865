use std::path::Path;

use rigbook_core::export::{parse_json, render_json};

use crate::commands::common::open_garage;
use crate::error::CliError;

pub async fn run_export(output_path: Option<&Path>, db_path: &Path) -> Result<(), CliError> {
    let garage = open_garage(db_path).await?;
    let rendered = render_json(&garage.export_snapshot().await)?;

    if let Some(path) = output_path {
        std::fs::write(path, rendered)?;
        println!("{}", path.display());
    } else {
        println!("{rendered}");
    }

    Ok(())
}

pub async fn run_import(path: &Path, db_path: &Path) -> Result<(), CliError> {
    let snapshot = parse_json(&std::fs::read_to_string(path)?)?;
    let garage = open_garage(db_path).await?;
    let summary = garage.import_snapshot(&snapshot).await?;

    println!(
        "Imported {}: {} created, {} updated, {} unchanged, {} skipped as deleted",
        path.display(),
        summary.created,
        summary.updated,
        summary.unchanged,
        summary.tombstoned
    );
    Ok(())
}
