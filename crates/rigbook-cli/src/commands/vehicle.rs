use std::path::Path;

use rigbook_core::{EntityKind, Vehicle};

use crate::cli::VehicleCommands;
use crate::commands::common::{
    delete_entity, format_vehicle_lines, open_garage, resolve, resolve_optional,
    vehicle_from_args, vehicle_to_list_item, Garage, VehicleListItem,
};
use crate::error::CliError;

pub async fn run_vehicle(command: VehicleCommands, db_path: &Path) -> Result<(), CliError> {
    let garage = open_garage(db_path).await?;
    match command {
        VehicleCommands::Add { vehicle_type, body } => {
            let vehicle = garage
                .add_vehicle(vehicle_from_args(vehicle_type, body)?)
                .await?;
            println!("{}", vehicle.id);
        }
        VehicleCommands::List { json } => {
            let vehicles = garage.vehicles().await;
            if json {
                let json_items = vehicles
                    .iter()
                    .map(vehicle_to_list_item)
                    .collect::<Vec<VehicleListItem>>();
                println!("{}", serde_json::to_string_pretty(&json_items)?);
            } else {
                for line in format_vehicle_lines(&vehicles) {
                    println!("{line}");
                }
            }
        }
        VehicleCommands::Delete { id, push } => {
            delete_entity(&garage, EntityKind::Vehicle, &id, push).await?;
        }
        VehicleCommands::Link { vehicle, trailer } => {
            let vehicle = link(&garage, &vehicle, trailer.as_deref()).await?;
            match vehicle.trailer_id {
                Some(trailer_id) => println!("{} -> {trailer_id}", vehicle.id),
                None => println!("{} unhitched", vehicle.id),
            }
        }
    }
    Ok(())
}

pub async fn link(
    garage: &Garage,
    vehicle: &str,
    trailer: Option<&str>,
) -> Result<Vehicle, CliError> {
    let vehicle_id = resolve(garage, EntityKind::Vehicle, vehicle).await?;
    let trailer_id = resolve_optional(garage, EntityKind::Trailer, trailer).await?;
    Ok(garage.link_trailer(vehicle_id, trailer_id).await?)
}
