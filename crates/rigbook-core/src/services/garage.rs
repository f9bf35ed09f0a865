//! Application-level mutations on the local garage.
//!
//! Every edit goes through [`GarageService`] so it bumps `last_modified`,
//! queues the entity for the next push and is persisted before returning.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::SyncOptions;
use crate::db::LocalStore;
use crate::export::{self, ImportSummary, Snapshot};
use crate::graph::{EntityKey, GraphEntity, LocalGraph};
use crate::models::{
    Checklist, ChecklistItem, DriveLog, EntityId, EntityKind, ItemState, SyncConflict, Trailer,
    Vehicle,
};
use crate::sync::{RemoteStore, SyncEngine, TombstoneLedger};
use crate::util::{normalize_text_option, now_millis};
use crate::{Error, Result};

/// Shared handle to the local replica.
pub struct GarageService<S> {
    graph: Arc<Mutex<LocalGraph>>,
    store: Arc<S>,
}

impl<S> Clone for GarageService<S> {
    fn clone(&self) -> Self {
        Self {
            graph: Arc::clone(&self.graph),
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LocalStore + 'static> GarageService<S> {
    /// Load the replica from `store`.
    pub async fn open(store: S) -> Result<Self> {
        let graph = store.load_graph().await?;
        Ok(Self {
            graph: Arc::new(Mutex::new(graph)),
            store: Arc::new(store),
        })
    }

    /// Sync engine sharing this garage's graph and store.
    pub fn sync_engine<R: RemoteStore + ?Sized + 'static>(
        &self,
        remote: Arc<R>,
        options: SyncOptions,
    ) -> SyncEngine<S, R> {
        SyncEngine::new(
            Arc::clone(&self.graph),
            Arc::clone(&self.store),
            remote,
            options,
        )
    }

    pub async fn vehicles(&self) -> Vec<Vehicle> {
        let graph = self.graph.lock().await;
        let mut vehicles = graph.vehicles().cloned().collect::<Vec<_>>();
        vehicles.sort_by_cached_key(|vehicle| (vehicle.display_name(), vehicle.id));
        vehicles
    }

    pub async fn trailers(&self) -> Vec<Trailer> {
        let graph = self.graph.lock().await;
        let mut trailers = graph.trailers().cloned().collect::<Vec<_>>();
        trailers.sort_by_cached_key(|trailer| (trailer.display_name(), trailer.id));
        trailers
    }

    /// Drive logs, newest first; all vehicles when `vehicle_id` is `None`.
    pub async fn drive_logs(&self, vehicle_id: Option<EntityId>) -> Vec<DriveLog> {
        let graph = self.graph.lock().await;
        let mut logs = graph
            .drive_logs()
            .filter(|log| vehicle_id.is_none() || log.vehicle_id == vehicle_id)
            .cloned()
            .collect::<Vec<_>>();
        logs.sort_by_key(|log| std::cmp::Reverse(log.date));
        logs
    }

    pub async fn checklists(&self) -> Vec<(Checklist, Vec<ChecklistItem>)> {
        let graph = self.graph.lock().await;
        let mut checklists = graph
            .checklists()
            .map(|checklist| {
                let items = graph
                    .items_of(&checklist.id)
                    .into_iter()
                    .cloned()
                    .collect::<Vec<_>>();
                (checklist.clone(), items)
            })
            .collect::<Vec<_>>();
        checklists.sort_by(|a, b| a.0.title.cmp(&b.0.title).then(a.0.id.cmp(&b.0.id)));
        checklists
    }

    /// Resolve a full id or a unique prefix of one.
    pub async fn resolve_id(&self, kind: EntityKind, prefix: &str) -> Result<EntityId> {
        let needle = prefix.trim().to_ascii_lowercase();
        if needle.is_empty() {
            return Err(Error::InvalidInput("id cannot be empty".to_string()));
        }

        let graph = self.graph.lock().await;
        let ids = match kind {
            EntityKind::Vehicle => graph.ids::<Vehicle>(),
            EntityKind::Trailer => graph.ids::<Trailer>(),
            EntityKind::DriveLog => graph.ids::<DriveLog>(),
            EntityKind::Checklist => graph.ids::<Checklist>(),
            EntityKind::ChecklistItem => graph.ids::<ChecklistItem>(),
        };
        let matches = ids
            .into_iter()
            .filter(|id| id.to_string().starts_with(&needle))
            .collect::<Vec<_>>();

        match matches.as_slice() {
            [id] => Ok(*id),
            [] => Err(Error::NotFound(format!("{kind} {prefix}"))),
            _ => Err(Error::InvalidInput(format!(
                "{kind} id prefix {prefix} is ambiguous ({} matches)",
                matches.len()
            ))),
        }
    }

    pub async fn add_vehicle(&self, mut vehicle: Vehicle) -> Result<Vehicle> {
        let mut graph = self.graph.lock().await;
        if let Some(trailer_id) = vehicle.trailer_id {
            require::<Trailer>(&graph, &trailer_id)?;
            release_trailer(&mut graph, trailer_id, vehicle.id);
        }
        vehicle.touch();
        graph.insert(vehicle.clone());
        self.persist(&mut graph).await?;
        Ok(vehicle)
    }

    pub async fn update_vehicle(
        &self,
        id: EntityId,
        change: impl FnOnce(&mut Vehicle) + Send,
    ) -> Result<Vehicle> {
        let mut graph = self.graph.lock().await;
        let vehicle = graph
            .get_mut::<Vehicle>(&id)
            .ok_or_else(|| not_found(EntityKind::Vehicle, &id))?;
        change(vehicle);
        vehicle.id = id;
        vehicle.touch();
        let vehicle = vehicle.clone();
        self.persist(&mut graph).await?;
        Ok(vehicle)
    }

    pub async fn add_trailer(&self, mut trailer: Trailer) -> Result<Trailer> {
        let mut graph = self.graph.lock().await;
        trailer.touch();
        graph.insert(trailer.clone());
        self.persist(&mut graph).await?;
        Ok(trailer)
    }

    pub async fn update_trailer(
        &self,
        id: EntityId,
        change: impl FnOnce(&mut Trailer) + Send,
    ) -> Result<Trailer> {
        let mut graph = self.graph.lock().await;
        let trailer = graph
            .get_mut::<Trailer>(&id)
            .ok_or_else(|| not_found(EntityKind::Trailer, &id))?;
        change(trailer);
        trailer.id = id;
        trailer.touch();
        let trailer = trailer.clone();
        self.persist(&mut graph).await?;
        Ok(trailer)
    }

    /// Hitch `trailer_id` to the vehicle, or unhitch with `None`.
    ///
    /// A trailer is hitched to one vehicle at a time; any previous vehicle
    /// loses the link.
    pub async fn link_trailer(
        &self,
        vehicle_id: EntityId,
        trailer_id: Option<EntityId>,
    ) -> Result<Vehicle> {
        let mut graph = self.graph.lock().await;
        require::<Vehicle>(&graph, &vehicle_id)?;
        if let Some(trailer_id) = trailer_id {
            require::<Trailer>(&graph, &trailer_id)?;
            release_trailer(&mut graph, trailer_id, vehicle_id);
        }

        let vehicle = graph
            .get_mut::<Vehicle>(&vehicle_id)
            .ok_or_else(|| not_found(EntityKind::Vehicle, &vehicle_id))?;
        vehicle.trailer_id = trailer_id;
        vehicle.touch();
        let vehicle = vehicle.clone();
        self.persist(&mut graph).await?;
        Ok(vehicle)
    }

    pub async fn add_drive_log(&self, mut log: DriveLog) -> Result<DriveLog> {
        validate_odometer(&log)?;
        let mut graph = self.graph.lock().await;
        let vehicle_id = log
            .vehicle_id
            .ok_or_else(|| Error::InvalidInput("a drive log needs a vehicle".to_string()))?;
        require::<Vehicle>(&graph, &vehicle_id)?;
        if let Some(checklist_id) = log.checklist_id {
            require::<Checklist>(&graph, &checklist_id)?;
        }
        log.reason = log.reason.trim().to_string();
        log.touch();
        graph.insert(log.clone());
        self.persist(&mut graph).await?;
        Ok(log)
    }

    pub async fn update_drive_log(
        &self,
        id: EntityId,
        change: impl FnOnce(&mut DriveLog) + Send,
    ) -> Result<DriveLog> {
        let mut graph = self.graph.lock().await;
        let mut updated = graph
            .get::<DriveLog>(&id)
            .cloned()
            .ok_or_else(|| not_found(EntityKind::DriveLog, &id))?;
        change(&mut updated);
        updated.id = id;
        validate_odometer(&updated)?;
        updated.touch();
        graph.insert(updated.clone());
        self.persist(&mut graph).await?;
        Ok(updated)
    }

    /// Create a checklist with its items, in the given order.
    pub async fn add_checklist(
        &self,
        mut checklist: Checklist,
        items: &[(String, String)],
    ) -> Result<(Checklist, Vec<ChecklistItem>)> {
        if checklist.title.trim().is_empty() {
            return Err(Error::InvalidInput(
                "checklist title cannot be empty".to_string(),
            ));
        }
        let mut graph = self.graph.lock().await;
        if let Some(vehicle_id) = checklist.vehicle_id {
            require::<Vehicle>(&graph, &vehicle_id)?;
        }
        if let Some(trailer_id) = checklist.trailer_id {
            require::<Trailer>(&graph, &trailer_id)?;
        }

        checklist.touch();
        let items = items
            .iter()
            .zip(0_i64..)
            .map(|((section, title), position)| {
                ChecklistItem::new(checklist.id, position, section.trim(), title.trim())
            })
            .collect::<Vec<_>>();
        graph.insert(checklist.clone());
        for item in &items {
            graph.insert(item.clone());
        }
        self.persist(&mut graph).await?;
        Ok((checklist, items))
    }

    /// Append an item; the checklist counts as edited.
    pub async fn add_checklist_item(
        &self,
        checklist_id: EntityId,
        section: &str,
        title: &str,
    ) -> Result<ChecklistItem> {
        let mut graph = self.graph.lock().await;
        require::<Checklist>(&graph, &checklist_id)?;
        let position = graph
            .items_of(&checklist_id)
            .last()
            .map_or(0, |item| item.position + 1);

        let item = ChecklistItem::new(checklist_id, position, section.trim(), title.trim());
        graph.insert(item.clone());
        touch_checklist(&mut graph, &checklist_id);
        self.persist(&mut graph).await?;
        Ok(item)
    }

    /// Record an item's state. Items carry no timestamp of their own, so
    /// the owning checklist is bumped.
    pub async fn set_item_state(
        &self,
        item_id: EntityId,
        state: ItemState,
        note: Option<String>,
    ) -> Result<ChecklistItem> {
        let mut graph = self.graph.lock().await;
        let item = graph
            .get_mut::<ChecklistItem>(&item_id)
            .ok_or_else(|| not_found(EntityKind::ChecklistItem, &item_id))?;
        item.state = state;
        item.note = normalize_text_option(note);
        item.needs_push = true;
        let item = item.clone();

        if let Some(checklist_id) = item.checklist_id {
            touch_checklist(&mut graph, &checklist_id);
        }
        self.persist(&mut graph).await?;
        Ok(item)
    }

    /// Delete an entity and its dependents, leaving tombstones to push.
    ///
    /// Returns every tombstoned key.
    pub async fn delete(&self, kind: EntityKind, id: EntityId) -> Result<Vec<EntityKey>> {
        let mut graph = self.graph.lock().await;
        if !graph.contains(kind, &id) {
            return Err(not_found(kind, &id));
        }
        let parent = match kind {
            EntityKind::ChecklistItem => graph
                .get::<ChecklistItem>(&id)
                .and_then(|item| item.checklist_id),
            _ => None,
        };

        let keys = TombstoneLedger::new(&mut graph).delete_cascade(kind, id, now_millis());
        if let Some(checklist_id) = parent {
            touch_checklist(&mut graph, &checklist_id);
        }
        tracing::info!("Deleted {kind} {id} with {} dependents", keys.len() - 1);
        self.persist(&mut graph).await?;
        Ok(keys)
    }

    pub async fn conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.store.list_conflicts(limit).await
    }

    pub async fn export_snapshot(&self) -> Snapshot {
        let graph = self.graph.lock().await;
        export::export(&graph)
    }

    pub async fn import_snapshot(&self, snapshot: &Snapshot) -> Result<ImportSummary> {
        let mut graph = self.graph.lock().await;
        let summary = export::import(&mut graph, snapshot)?;
        self.persist(&mut graph).await?;
        Ok(summary)
    }

    async fn persist(&self, graph: &mut LocalGraph) -> Result<()> {
        let changes = graph.take_changes();
        if changes.is_empty() {
            return Ok(());
        }
        if let Err(error) = self.store.save_changes(graph, &changes).await {
            graph.restore_changes(changes);
            return Err(error);
        }
        Ok(())
    }
}

fn not_found(kind: EntityKind, id: &EntityId) -> Error {
    Error::NotFound(format!("{kind} {id}"))
}

fn require<E: GraphEntity>(graph: &LocalGraph, id: &EntityId) -> Result<()> {
    if graph.get::<E>(id).is_some() {
        Ok(())
    } else {
        Err(not_found(E::KIND, id))
    }
}

fn validate_odometer(log: &DriveLog) -> Result<()> {
    if !log.start_odometer.is_finite() || !log.end_odometer.is_finite() {
        return Err(Error::InvalidInput(
            "odometer readings must be numbers".to_string(),
        ));
    }
    if log.end_odometer < log.start_odometer {
        return Err(Error::InvalidInput(format!(
            "end odometer {} is below start odometer {}",
            log.end_odometer, log.start_odometer
        )));
    }
    Ok(())
}

fn touch_checklist(graph: &mut LocalGraph, id: &EntityId) {
    if let Some(checklist) = graph.get_mut::<Checklist>(id) {
        checklist.touch();
    }
}

/// Unhitch `trailer_id` from every vehicle other than `keep`.
fn release_trailer(graph: &mut LocalGraph, trailer_id: EntityId, keep: EntityId) {
    let holders = graph
        .vehicles()
        .filter(|vehicle| vehicle.id != keep && vehicle.trailer_id == Some(trailer_id))
        .map(|vehicle| vehicle.id)
        .collect::<Vec<_>>();
    for id in holders {
        if let Some(vehicle) = graph.get_mut::<Vehicle>(&id) {
            vehicle.trailer_id = None;
            vehicle.touch();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VehicleType;
    use crate::services::DatabaseService;
    use crate::sync::{MemoryRemoteStore, RecordId};
    use pretty_assertions::assert_eq;

    async fn garage() -> GarageService<DatabaseService> {
        GarageService::open(DatabaseService::open_in_memory().await.unwrap())
            .await
            .unwrap()
    }

    fn truck(plate: &str) -> Vehicle {
        let mut vehicle = Vehicle::new(VehicleType::Truck);
        vehicle.plate = plate.to_string();
        vehicle
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn edits_bump_timestamp_and_persist() {
        let garage = garage().await;
        let vehicle = garage.add_vehicle(truck("ABC-1")).await.unwrap();

        let updated = garage
            .update_vehicle(vehicle.id, |v| v.color = "Red".to_string())
            .await
            .unwrap();

        assert!(updated.last_modified > vehicle.last_modified);
        assert!(updated.needs_push);
        let reloaded = garage.store.load_graph().await.unwrap();
        assert_eq!(reloaded.get::<Vehicle>(&vehicle.id), Some(&updated));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn linking_a_trailer_unhitches_previous_vehicle() {
        let garage = garage().await;
        let trailer = garage.add_trailer(Trailer::new()).await.unwrap();
        let first = garage.add_vehicle(truck("ONE")).await.unwrap();
        let second = garage.add_vehicle(truck("TWO")).await.unwrap();

        garage.link_trailer(first.id, Some(trailer.id)).await.unwrap();
        garage.link_trailer(second.id, Some(trailer.id)).await.unwrap();

        let vehicles = garage.vehicles().await;
        let hitched = vehicles
            .iter()
            .filter(|vehicle| vehicle.trailer_id == Some(trailer.id))
            .map(|vehicle| vehicle.id)
            .collect::<Vec<_>>();
        assert_eq!(hitched, vec![second.id]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drive_log_requires_vehicle_and_sane_odometer() {
        let garage = garage().await;
        let orphan = DriveLog::new(EntityId::new());
        assert!(matches!(
            garage.add_drive_log(orphan).await,
            Err(Error::NotFound(_))
        ));

        let vehicle = garage.add_vehicle(truck("ABC-1")).await.unwrap();
        let mut backwards = DriveLog::new(vehicle.id);
        backwards.start_odometer = 1200.0;
        backwards.end_odometer = 1100.0;
        assert!(matches!(
            garage.add_drive_log(backwards).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn item_state_bumps_owning_checklist() {
        let garage = garage().await;
        let (checklist, items) = garage
            .add_checklist(
                Checklist::new(VehicleType::Car, "Daily"),
                &[("Lights".to_string(), "Headlights".to_string())],
            )
            .await
            .unwrap();

        let item = garage
            .set_item_state(items[0].id, ItemState::Flagged, Some(" left bulb out ".to_string()))
            .await
            .unwrap();

        assert_eq!(item.note.as_deref(), Some("left bulb out"));
        let (after, _) = garage.checklists().await.remove(0);
        assert!(after.last_modified > checklist.last_modified);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn appended_items_go_last() {
        let garage = garage().await;
        let (checklist, _) = garage
            .add_checklist(
                Checklist::new(VehicleType::Car, "Daily"),
                &[
                    ("".to_string(), "First".to_string()),
                    ("".to_string(), "Second".to_string()),
                ],
            )
            .await
            .unwrap();

        let third = garage
            .add_checklist_item(checklist.id, "", "Third")
            .await
            .unwrap();
        assert_eq!(third.position, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_cascades_into_tombstones() {
        let garage = garage().await;
        let vehicle = garage.add_vehicle(truck("ABC-1")).await.unwrap();
        garage.add_drive_log(DriveLog::new(vehicle.id)).await.unwrap();
        garage.add_drive_log(DriveLog::new(vehicle.id)).await.unwrap();
        let mut checklist = Checklist::new(VehicleType::Truck, "Pre-trip");
        checklist.vehicle_id = Some(vehicle.id);
        garage
            .add_checklist(
                checklist,
                &[
                    ("Brakes".to_string(), "Air".to_string()),
                    ("Tyres".to_string(), "Pressure".to_string()),
                    ("Lights".to_string(), "Beams".to_string()),
                ],
            )
            .await
            .unwrap();

        let keys = garage.delete(EntityKind::Vehicle, vehicle.id).await.unwrap();

        // vehicle + 2 logs + 1 checklist + 3 items
        assert_eq!(keys.len(), 7);
        assert!(garage.vehicles().await.is_empty());
        assert!(garage.drive_logs(None).await.is_empty());
        let reloaded = garage.store.load_graph().await.unwrap();
        assert_eq!(reloaded.tombstones().count(), 7);
        assert!(reloaded.tombstones().all(|tombstone| !tombstone.pushed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_id_accepts_unique_prefix() {
        let garage = garage().await;
        let vehicle = garage.add_vehicle(truck("ABC-1")).await.unwrap();
        let full = vehicle.id.to_string();

        assert_eq!(
            garage
                .resolve_id(EntityKind::Vehicle, &full[..8].to_uppercase())
                .await
                .unwrap(),
            vehicle.id
        );
        assert!(matches!(
            garage.resolve_id(EntityKind::Trailer, &full).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            garage.resolve_id(EntityKind::Vehicle, "  ").await,
            Err(Error::InvalidInput(_))
        ));
    }

    /// Device A and B share a vehicle; A changes the plate, B later changes
    /// the color with an older timestamp. A's newer full record wins and B's
    /// color edit is lost.
    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_edits_resolve_to_newest_full_record() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let device_a = garage().await;
        let device_b = garage().await;
        let sync_a = device_a.sync_engine(Arc::clone(&remote), SyncOptions::default());
        let sync_b = device_b.sync_engine(Arc::clone(&remote), SyncOptions::default());

        let v1 = device_a.add_vehicle(truck("ABC-1")).await.unwrap();
        let t0 = v1.last_modified;
        sync_a.perform_full_sync().await.unwrap();
        sync_b.perform_full_sync().await.unwrap();
        assert_eq!(device_b.vehicles().await[0].plate, "ABC-1");

        device_a
            .update_vehicle(v1.id, |v| v.plate = "XYZ-9".to_string())
            .await
            .unwrap();
        {
            let mut graph = device_a.graph.lock().await;
            graph.get_mut::<Vehicle>(&v1.id).unwrap().last_modified = t0 + 2_000;
        }
        sync_a.perform_full_sync().await.unwrap();

        device_b
            .update_vehicle(v1.id, |v| v.color = "Red".to_string())
            .await
            .unwrap();
        {
            let mut graph = device_b.graph.lock().await;
            graph.get_mut::<Vehicle>(&v1.id).unwrap().last_modified = t0 + 1_000;
        }
        sync_b.perform_full_sync().await.unwrap();

        let on_b = device_b.vehicles().await.remove(0);
        assert_eq!(on_b.plate, "XYZ-9");
        assert_eq!(on_b.color, "");
        assert_eq!(on_b.last_modified, t0 + 2_000);
        assert_eq!(device_b.conflicts(10).await.unwrap().len(), 1);

        let stored = remote
            .record(
                &SyncOptions::default().zone,
                &RecordId::for_entity(EntityKind::Vehicle, &v1.id),
            )
            .await
            .unwrap();
        assert_eq!(stored.text("plate"), "XYZ-9");
    }
}
