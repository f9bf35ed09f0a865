use std::path::Path;
use std::sync::Arc;

use rigbook_core::sync::RemoteStore;
use rigbook_core::SyncReport;

use crate::commands::common::{
    format_sync_conflict_lines, format_sync_timestamp, open_garage, open_remote,
    sync_conflict_to_item, sync_options, Garage, SyncConflictItem,
};
use crate::error::CliError;

pub async fn run_sync(full: bool, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let remote = open_remote().await?;
    let garage = open_garage(db_path).await?;
    let report = sync_with(&garage, remote, full).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in format_sync_report(&report) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn sync_with<R: RemoteStore + ?Sized + 'static>(
    garage: &Garage,
    remote: Arc<R>,
    full: bool,
) -> Result<SyncReport, CliError> {
    let engine = garage.sync_engine(remote, sync_options(full)?);
    Ok(engine.perform_full_sync().await?)
}

pub fn format_sync_report(report: &SyncReport) -> Vec<String> {
    let mut lines = vec![format!(
        "Sync completed at {}",
        format_sync_timestamp(report.finished_at)
    )];
    for entry in &report.kinds {
        let Some(kind) = entry.kind else { continue };
        if entry.fetched == 0 && entry.pushed == 0 && entry.push_failures == 0 {
            continue;
        }
        lines.push(format!(
            "  {:<13} fetched {:>4}  created {:>4}  updated {:>4}  pushed {:>4}  failed {:>4}",
            kind.type_tag(),
            entry.fetched,
            entry.created,
            entry.updated,
            entry.pushed,
            entry.push_failures
        ));
    }
    lines.push(format!(
        "  tombstones    pushed {}  applied {}  removed {} local records",
        report.tombstones_pushed, report.tombstones_applied, report.entities_removed
    ));
    if !report.conflicts.is_empty() {
        lines.push(format!(
            "  {} conflicts resolved (see `rigbook conflicts`)",
            report.conflicts.len()
        ));
    }
    lines.extend(
        report
            .errors
            .iter()
            .map(|error| format!("  warning: {error}")),
    );
    lines
}

pub async fn run_sync_conflicts(
    limit: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let garage = open_garage(db_path).await?;
    let conflicts = garage.conflicts(limit).await?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(sync_conflict_to_item)
            .collect::<Vec<SyncConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_sync_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}
