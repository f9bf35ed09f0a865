use std::path::Path;

use rigbook_core::EntityKind;

use crate::cli::TrailerCommands;
use crate::commands::common::{
    delete_entity, format_trailer_lines, open_garage, trailer_from_args, trailer_to_list_item,
    TrailerListItem,
};
use crate::error::CliError;

pub async fn run_trailer(command: TrailerCommands, db_path: &Path) -> Result<(), CliError> {
    let garage = open_garage(db_path).await?;
    match command {
        TrailerCommands::Add { body } => {
            let trailer = garage.add_trailer(trailer_from_args(body)?).await?;
            println!("{}", trailer.id);
        }
        TrailerCommands::List { json } => {
            let trailers = garage.trailers().await;
            if json {
                let json_items = trailers
                    .iter()
                    .map(trailer_to_list_item)
                    .collect::<Vec<TrailerListItem>>();
                println!("{}", serde_json::to_string_pretty(&json_items)?);
            } else {
                for line in format_trailer_lines(&trailers) {
                    println!("{line}");
                }
            }
        }
        TrailerCommands::Delete { id, push } => {
            delete_entity(&garage, EntityKind::Trailer, &id, push).await?;
        }
    }
    Ok(())
}
