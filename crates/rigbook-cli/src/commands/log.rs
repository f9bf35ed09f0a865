use std::path::Path;

use rigbook_core::{DriveLog, EntityKind};

use crate::cli::{LogAddArgs, LogCommands};
use crate::commands::common::{
    drive_log_to_list_item, format_drive_log_lines, open_garage, parse_drive_date, resolve,
    resolve_optional, DriveLogListItem, Garage,
};
use crate::error::CliError;

pub async fn run_log(command: LogCommands, db_path: &Path) -> Result<(), CliError> {
    let garage = open_garage(db_path).await?;
    match command {
        LogCommands::Add(args) => {
            let log = add_log(&garage, args).await?;
            println!("{}", log.id);
        }
        LogCommands::List {
            vehicle,
            limit,
            json,
        } => {
            let vehicle_id =
                resolve_optional(&garage, EntityKind::Vehicle, vehicle.as_deref()).await?;
            let mut logs = garage.drive_logs(vehicle_id).await;
            logs.truncate(limit);

            if json {
                let json_items = logs
                    .iter()
                    .map(drive_log_to_list_item)
                    .collect::<Vec<DriveLogListItem>>();
                println!("{}", serde_json::to_string_pretty(&json_items)?);
            } else {
                for line in format_drive_log_lines(&logs) {
                    println!("{line}");
                }
            }
        }
    }
    Ok(())
}

pub async fn add_log(garage: &Garage, args: LogAddArgs) -> Result<DriveLog, CliError> {
    let vehicle_id = resolve(garage, EntityKind::Vehicle, &args.vehicle).await?;
    let mut log = DriveLog::new(vehicle_id);
    if let Some(date) = args.date.as_deref() {
        log.date = parse_drive_date(date)?;
    }
    log.reason = args.reason;
    log.start_odometer = args.start;
    log.end_odometer = args.end;
    log.notes = args.notes.trim().to_string();
    log.checklist_id =
        resolve_optional(garage, EntityKind::Checklist, args.checklist.as_deref()).await?;
    Ok(garage.add_drive_log(log).await?)
}
