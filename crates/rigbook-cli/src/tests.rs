use std::path::Path;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use pretty_assertions::assert_eq;
use rigbook_core::models::ConflictWinner;
use rigbook_core::sync::{MemoryRemoteStore, TransportError};
use rigbook_core::{
    DatabaseService, EntityKind, GarageService, ItemState, SyncConflict, VehicleType,
};

use crate::cli::{
    parse_item_state, parse_vehicle_type, BodyArgs, ChecklistAddArgs, Cli, Commands, LogAddArgs,
    VehicleCommands,
};
use crate::commands::checklist::add_checklist;
use crate::commands::common::{
    format_relative_time, format_sync_conflict_lines, format_sync_timestamp, normalize_identifier,
    open_garage, parse_drive_date, parse_item_spec, trailer_from_args, vehicle_from_args, Garage,
};
use crate::commands::export::{run_export, run_import};
use crate::commands::log::add_log;
use crate::commands::sync::{format_sync_report, sync_with};
use crate::commands::vehicle::link;
use crate::error::CliError;

async fn memory_garage() -> Garage {
    let store = DatabaseService::open_in_memory().await.unwrap();
    GarageService::open(store).await.unwrap()
}

fn body(plate: &str) -> BodyArgs {
    BodyArgs {
        plate: plate.to_string(),
        ..BodyArgs::default()
    }
}

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn vehicle_add_parses_type_and_body() {
    let cli = Cli::try_parse_from([
        "rigbook", "vehicle", "add", "--type", "Truck", "--plate", "AB-12",
    ])
    .unwrap();

    let Commands::Vehicle {
        command: VehicleCommands::Add { vehicle_type, body },
    } = cli.command
    else {
        panic!("expected vehicle add");
    };
    assert_eq!(vehicle_type, VehicleType::Truck);
    assert_eq!(body.plate, "AB-12");
}

#[test]
fn unknown_vehicle_type_is_rejected() {
    assert!(parse_vehicle_type("hovercraft").is_err());
    assert_eq!(parse_vehicle_type(" camper ").unwrap(), VehicleType::Camper);
    assert!(Cli::try_parse_from(["rigbook", "vehicle", "add", "--type", "boat"]).is_err());
}

#[test]
fn item_state_parses_case_insensitively() {
    assert_eq!(parse_item_state("FLAGGED").unwrap(), ItemState::Flagged);
    assert!(parse_item_state("maybe").is_err());
}

#[test]
fn item_spec_splits_section_and_title() {
    assert_eq!(
        parse_item_spec("Brakes: Air pressure").unwrap(),
        ("Brakes".to_string(), "Air pressure".to_string())
    );
    assert_eq!(
        parse_item_spec("  Tyres ").unwrap(),
        ("General".to_string(), "Tyres".to_string())
    );
    assert!(matches!(
        parse_item_spec("Brakes:"),
        Err(CliError::InvalidItem(_))
    ));
    assert!(matches!(parse_item_spec(": x"), Err(CliError::InvalidItem(_))));
}

#[test]
fn drive_date_accepts_rfc3339_and_plain_dates() {
    assert_eq!(parse_drive_date("1970-01-02").unwrap(), 86_400_000);
    assert_eq!(parse_drive_date("1970-01-01T00:00:01Z").unwrap(), 1_000);
    assert!(matches!(
        parse_drive_date("yesterday"),
        Err(CliError::InvalidDate(_))
    ));
}

#[test]
fn normalize_identifier_rejects_empty() {
    assert!(matches!(normalize_identifier(" \n "), Err(CliError::EmptyId)));
    assert_eq!(normalize_identifier("  abc123  ").unwrap(), "abc123");
}

#[test]
fn remote_failures_keep_their_transport_message() {
    let error = CliError::from(TransportError::Unavailable("offline".to_string()));
    assert!(matches!(error, CliError::Transport(_)));
    assert_eq!(error.to_string(), "remote store unavailable: offline");
}

#[test]
fn format_relative_time_units() {
    let now = 10_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
}

#[test]
fn format_sync_timestamp_returns_utc_label() {
    assert_eq!(format_sync_timestamp(0), "1970-01-01 00:00:00 UTC");
}

#[test]
fn format_sync_conflict_lines_include_key_fields() {
    let conflicts = vec![SyncConflict {
        id: 1,
        entity_kind: EntityKind::Vehicle,
        entity_id: "11111111-1111-7111-8111-111111111111".to_string(),
        local_modified: 200,
        remote_modified: 300,
        resolved_at: 400,
        winner: ConflictWinner::Remote,
        strategy: "lww".to_string(),
    }];

    let rendered = format_sync_conflict_lines(&conflicts);
    assert_eq!(rendered.len(), 1);
    assert!(rendered[0].contains("lww"));
    assert!(rendered[0].contains("Vehicle"));
    assert!(rendered[0].contains("11111111-1111-7111-8111-111111111111"));
    assert!(rendered[0].contains("winner=remote"));
    assert!(rendered[0].contains("local=200 remote=300"));
}

#[tokio::test(flavor = "multi_thread")]
async fn link_resolves_ids_case_insensitively() {
    let garage = memory_garage().await;
    let vehicle = garage
        .add_vehicle(vehicle_from_args(VehicleType::Truck, body("AB-12")).unwrap())
        .await
        .unwrap();
    let trailer = garage
        .add_trailer(trailer_from_args(body("TR-1")).unwrap())
        .await
        .unwrap();

    let upper = trailer.id.to_string().to_uppercase();
    let linked = link(&garage, &vehicle.id.to_string(), Some(&upper))
        .await
        .unwrap();
    assert_eq!(linked.trailer_id, Some(trailer.id));

    let unlinked = link(&garage, &vehicle.id.to_string(), None).await.unwrap();
    assert_eq!(unlinked.trailer_id, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn log_and_checklist_commands_reference_existing_entities() {
    let garage = memory_garage().await;
    let vehicle = garage
        .add_vehicle(vehicle_from_args(VehicleType::Van, body("VAN-1")).unwrap())
        .await
        .unwrap();

    let (checklist, items) = add_checklist(
        &garage,
        ChecklistAddArgs {
            title: " Morning check ".to_string(),
            vehicle_type: VehicleType::Van,
            vehicle: Some(vehicle.id.to_string()),
            trailer: None,
            items: vec!["Brakes: Pedal feel".to_string(), "Mirrors".to_string()],
        },
    )
    .await
    .unwrap();
    assert_eq!(checklist.title, "Morning check");
    assert_eq!(checklist.vehicle_id, Some(vehicle.id));
    assert_eq!(
        items
            .iter()
            .map(|item| (item.section.as_str(), item.title.as_str()))
            .collect::<Vec<_>>(),
        vec![("Brakes", "Pedal feel"), ("General", "Mirrors")]
    );

    let log = add_log(
        &garage,
        LogAddArgs {
            vehicle: vehicle.id.to_string(),
            reason: "Delivery".to_string(),
            start: 100.0,
            end: 142.5,
            notes: String::new(),
            date: Some("2024-05-01".to_string()),
            checklist: Some(checklist.id.to_string()),
        },
    )
    .await
    .unwrap();
    assert_eq!(log.vehicle_id, Some(vehicle.id));
    assert_eq!(log.checklist_id, Some(checklist.id));
    assert_eq!(log.date, parse_drive_date("2024-05-01").unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_vehicle_id_is_reported() {
    let garage = memory_garage().await;
    let result = add_log(
        &garage,
        LogAddArgs {
            vehicle: "0000".to_string(),
            reason: String::new(),
            start: 0.0,
            end: 0.0,
            notes: String::new(),
            date: None,
            checklist: None,
        },
    )
    .await;

    assert!(matches!(
        result,
        Err(CliError::Core(rigbook_core::Error::NotFound(_)))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_moves_edits_between_garages() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let phone = memory_garage().await;
    let laptop = memory_garage().await;

    let vehicle = phone
        .add_vehicle(vehicle_from_args(VehicleType::Car, body("SYNC-1")).unwrap())
        .await
        .unwrap();

    let pushed = sync_with(&phone, Arc::clone(&remote), false).await.unwrap();
    assert_eq!(pushed.total_pushed(), 1);
    let lines = format_sync_report(&pushed);
    assert!(lines.iter().any(|line| line.contains("Vehicle")));

    let fetched = sync_with(&laptop, remote, false).await.unwrap();
    assert!(fetched.is_clean());
    let vehicles = laptop.vehicles().await;
    assert_eq!(vehicles.len(), 1);
    assert_eq!(vehicles[0].id, vehicle.id);
    assert_eq!(vehicles[0].plate, "SYNC-1");
}

#[tokio::test(flavor = "multi_thread")]
async fn export_file_imports_into_another_replica() {
    let dir = tempfile::tempdir().unwrap();
    let source_db = dir.path().join("source.db");
    let target_db = dir.path().join("target.db");
    let snapshot = dir.path().join("snapshot.json");

    {
        let garage = open_garage(&source_db).await.unwrap();
        garage
            .add_trailer(trailer_from_args(body("TR-9")).unwrap())
            .await
            .unwrap();
    }

    run_export(Some(&snapshot), &source_db).await.unwrap();
    run_import(&snapshot, &target_db).await.unwrap();
    assert_imported_trailer(&target_db).await;
}

async fn assert_imported_trailer(db_path: &Path) {
    let garage = open_garage(db_path).await.unwrap();
    let trailers = garage.trailers().await;
    assert_eq!(trailers.len(), 1);
    assert_eq!(trailers[0].plate, "TR-9");
    assert!(trailers[0].needs_push);
}
