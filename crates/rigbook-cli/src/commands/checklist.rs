use std::path::Path;

use rigbook_core::{Checklist, ChecklistItem, EntityKind};

use crate::cli::{ChecklistAddArgs, ChecklistCommands};
use crate::commands::common::{
    checklist_to_list_item, delete_entity, format_checklist_lines, open_garage, parse_item_spec,
    resolve, resolve_optional, ChecklistListItem, Garage,
};
use crate::error::CliError;

pub async fn run_checklist(command: ChecklistCommands, db_path: &Path) -> Result<(), CliError> {
    let garage = open_garage(db_path).await?;
    match command {
        ChecklistCommands::Add(args) => {
            let (checklist, items) = add_checklist(&garage, args).await?;
            for line in format_checklist_lines(&checklist, &items) {
                println!("{line}");
            }
        }
        ChecklistCommands::List { json } => {
            let checklists = garage.checklists().await;
            if json {
                let json_items = checklists
                    .iter()
                    .map(|(checklist, items)| checklist_to_list_item(checklist, items))
                    .collect::<Vec<ChecklistListItem>>();
                println!("{}", serde_json::to_string_pretty(&json_items)?);
            } else if checklists.is_empty() {
                println!("No checklists yet.");
            } else {
                for (checklist, items) in &checklists {
                    for line in format_checklist_lines(checklist, items) {
                        println!("{line}");
                    }
                }
            }
        }
        ChecklistCommands::Check { item, state, note } => {
            let item_id = resolve(&garage, EntityKind::ChecklistItem, &item).await?;
            let item = garage.set_item_state(item_id, state, note).await?;
            println!("{} {}", item.state.marker(), item.title);
        }
        ChecklistCommands::Delete { id, push } => {
            delete_entity(&garage, EntityKind::Checklist, &id, push).await?;
        }
    }
    Ok(())
}

pub async fn add_checklist(
    garage: &Garage,
    args: ChecklistAddArgs,
) -> Result<(Checklist, Vec<ChecklistItem>), CliError> {
    let items = args
        .items
        .iter()
        .map(|spec| parse_item_spec(spec.as_str()))
        .collect::<Result<Vec<_>, _>>()?;

    let mut checklist = Checklist::new(args.vehicle_type, args.title.trim());
    checklist.vehicle_id =
        resolve_optional(garage, EntityKind::Vehicle, args.vehicle.as_deref()).await?;
    checklist.trailer_id =
        resolve_optional(garage, EntityKind::Trailer, args.trailer.as_deref()).await?;
    Ok(garage.add_checklist(checklist, &items).await?)
}
