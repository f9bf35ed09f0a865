//! Full sync protocol for one replica.
//!
//! A pass runs six steps in a fixed order:
//!
//! 1. push local tombstones
//! 2. apply remote tombstones
//! 3. fetch and merge every entity type, in dependency order
//! 4. persist the merged graph
//! 5. push pending entities
//! 6. push tombstones created by step 2's cascades
//!
//! Every step is best-effort: failures are recorded in the [`SyncReport`]
//! and the pass moves on. The local graph lock is never held across a
//! remote call.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncOptions;
use crate::db::LocalStore;
use crate::graph::{EntityKey, LocalGraph};
use crate::models::{
    Checklist, ChecklistItem, DriveLog, EntityKind, SyncConflict, Tombstone, Trailer, Vehicle,
};
use crate::util::now_millis;
use crate::{Error, Result};

use super::codec::{MergeContext, SyncEntity};
use super::ledger::{decode_tombstone, encode_tombstone, TombstoneLedger};
use super::reconciler::Reconciler;
use super::record::{Record, RecordId, SavePolicy, TOMBSTONE_RECORD_TYPE};
use super::remote::{RemoteStore, TransportError};
use super::transport::BatchTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    PushTombstones,
    ApplyTombstones,
    Fetch,
    Persist,
    Push,
    PushCascadedTombstones,
    RecordConflicts,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PushTombstones => "push tombstones",
            Self::ApplyTombstones => "apply remote tombstones",
            Self::Fetch => "fetch",
            Self::Persist => "persist",
            Self::Push => "push",
            Self::PushCascadedTombstones => "push cascaded tombstones",
            Self::RecordConflicts => "record conflicts",
        };
        f.write_str(name)
    }
}

/// A failure the pass recovered from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseError {
    pub phase: SyncPhase,
    pub kind: Option<EntityKind>,
    pub message: String,
}

impl fmt::Display for PhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "{} ({kind}): {}", self.phase, self.message),
            None => write!(f, "{}: {}", self.phase, self.message),
        }
    }
}

/// Per-type counts for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindReport {
    pub kind: Option<EntityKind>,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    /// Remote records ignored because the id is tombstoned
    pub suppressed: usize,
    /// Remote records that could not be decoded
    pub skipped: usize,
    pub pushed: usize,
    pub push_failures: usize,
}

/// Outcome of a sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub kinds: Vec<KindReport>,
    pub tombstones_pushed: usize,
    /// Remote tombstones seen for the first time
    pub tombstones_applied: usize,
    pub tombstones_skipped: usize,
    /// Local entities removed by remote tombstones, dependents included
    pub entities_removed: usize,
    pub conflicts: Vec<SyncConflict>,
    pub errors: Vec<PhaseError>,
    pub started_at: i64,
    pub finished_at: i64,
}

impl SyncReport {
    fn start() -> Self {
        Self {
            kinds: EntityKind::ALL
                .into_iter()
                .map(|kind| KindReport {
                    kind: Some(kind),
                    ..KindReport::default()
                })
                .collect(),
            started_at: now_millis(),
            ..Self::default()
        }
    }

    pub fn kind(&self, kind: EntityKind) -> Option<&KindReport> {
        self.kinds.iter().find(|entry| entry.kind == Some(kind))
    }

    fn kind_mut(&mut self, kind: EntityKind) -> &mut KindReport {
        if let Some(index) = self.kinds.iter().position(|entry| entry.kind == Some(kind)) {
            return &mut self.kinds[index];
        }
        self.kinds.push(KindReport {
            kind: Some(kind),
            ..KindReport::default()
        });
        let last = self.kinds.len() - 1;
        &mut self.kinds[last]
    }

    pub fn total_fetched(&self) -> usize {
        self.kinds.iter().map(|entry| entry.fetched).sum()
    }

    pub fn total_pushed(&self) -> usize {
        self.kinds.iter().map(|entry| entry.pushed).sum()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, phase: SyncPhase, kind: Option<EntityKind>, error: impl fmt::Display) {
        let entry = PhaseError {
            phase,
            kind,
            message: error.to_string(),
        };
        warn!("Sync step failed, continuing: {entry}");
        self.errors.push(entry);
    }
}

/// Sync engine for one local replica.
///
/// Cloning shares the graph, the stores and the in-progress guard.
pub struct SyncEngine<S, R: ?Sized> {
    graph: Arc<Mutex<LocalGraph>>,
    local: Arc<S>,
    remote: Arc<R>,
    options: SyncOptions,
    in_progress: Arc<Mutex<()>>,
}

impl<S, R: ?Sized> Clone for SyncEngine<S, R> {
    fn clone(&self) -> Self {
        Self {
            graph: Arc::clone(&self.graph),
            local: Arc::clone(&self.local),
            remote: Arc::clone(&self.remote),
            options: self.options.clone(),
            in_progress: Arc::clone(&self.in_progress),
        }
    }
}

impl<S, R> SyncEngine<S, R>
where
    S: LocalStore + 'static,
    R: RemoteStore + ?Sized + 'static,
{
    pub fn new(
        graph: Arc<Mutex<LocalGraph>>,
        local: Arc<S>,
        remote: Arc<R>,
        options: SyncOptions,
    ) -> Self {
        Self {
            graph,
            local,
            remote,
            options,
            in_progress: Arc::new(Mutex::new(())),
        }
    }

    pub const fn graph(&self) -> &Arc<Mutex<LocalGraph>> {
        &self.graph
    }

    pub const fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Run one full pass.
    ///
    /// Returns [`Error::SyncInProgress`] if another pass on this replica has
    /// not finished; every other failure is reported in the result.
    pub async fn perform_full_sync(&self) -> Result<SyncReport> {
        let Ok(_guard) = self.in_progress.try_lock() else {
            return Err(Error::SyncInProgress);
        };

        let mut report = SyncReport::start();
        let transport = self.transport();
        info!("Starting sync pass on zone {}", self.options.zone);

        self.push_tombstones(&transport, SyncPhase::PushTombstones, &mut report)
            .await;
        self.apply_remote_tombstones(&transport, &mut report).await;
        self.fetch_and_merge(&transport, &mut report).await;
        self.persist(SyncPhase::Persist, &mut report).await;
        self.push_entities(&transport, &mut report).await;
        self.push_tombstones(&transport, SyncPhase::PushCascadedTombstones, &mut report)
            .await;

        if !report.conflicts.is_empty() {
            if let Err(error) = self.local.record_conflicts(&report.conflicts).await {
                report.error(SyncPhase::RecordConflicts, None, error);
            }
        }

        report.finished_at = now_millis();
        info!(
            "Sync pass finished: fetched {}, pushed {}, tombstones pushed {}, applied {}, {} conflicts, {} errors",
            report.total_fetched(),
            report.total_pushed(),
            report.tombstones_pushed,
            report.tombstones_applied,
            report.conflicts.len(),
            report.errors.len()
        );
        Ok(report)
    }

    /// Push pending tombstones only; waits for a running pass to finish.
    pub async fn push_pending_tombstones(&self) -> SyncReport {
        let _guard = self.in_progress.lock().await;
        let mut report = SyncReport::start();
        let transport = self.transport();
        self.push_tombstones(&transport, SyncPhase::PushTombstones, &mut report)
            .await;
        report.finished_at = now_millis();
        report
    }

    /// Run [`Self::push_pending_tombstones`] in the background.
    ///
    /// Dropping the handle does not cancel the push, but a process that
    /// exits first loses it; the tombstones stay pending and go out with
    /// the next pass.
    pub fn spawn_tombstone_push(&self) -> JoinHandle<SyncReport> {
        let engine = self.clone();
        tokio::spawn(async move { engine.push_pending_tombstones().await })
    }

    fn transport(&self) -> BatchTransport<'_, R> {
        BatchTransport::new(self.remote.as_ref(), &self.options.zone)
            .with_chunk_limit(self.options.batch_limit)
    }

    /// Save tombstone records, then delete the records they stand for.
    ///
    /// A tombstone counts as pushed once its record is saved and the
    /// entity record is gone (deleted now, or never there).
    async fn push_tombstones(
        &self,
        transport: &BatchTransport<'_, R>,
        phase: SyncPhase,
        report: &mut SyncReport,
    ) {
        let pending = {
            let mut graph = self.graph.lock().await;
            TombstoneLedger::new(&mut graph).pending()
        };
        if pending.is_empty() {
            return;
        }

        let records = pending.iter().map(encode_tombstone).collect::<Vec<Record>>();
        let saved = match transport.save_batch(&records, SavePolicy::AllKeys).await {
            Ok(outcome) => outcome,
            Err(error) => {
                report.error(phase, None, error);
                return;
            }
        };
        let saved = saved.saved.into_iter().collect::<HashSet<_>>();
        let landed = pending
            .iter()
            .filter(|tombstone| saved.contains(&RecordId::for_tombstone(&tombstone.entity_id)))
            .collect::<Vec<_>>();

        let entity_records = landed
            .iter()
            .map(|tombstone| RecordId::for_entity(tombstone.kind, &tombstone.entity_id))
            .collect::<Vec<_>>();
        let deleted = match transport.delete_batch(&entity_records).await {
            Ok(outcome) => outcome,
            Err(error) => {
                report.error(phase, None, error);
                return;
            }
        };
        let refused = deleted
            .hard_failures()
            .map(|failure| failure.record_id.clone())
            .collect::<HashSet<_>>();

        let confirmed = {
            let mut graph = self.graph.lock().await;
            let confirmed = landed
                .into_iter()
                .filter(|sent| {
                    !refused.contains(&RecordId::for_entity(sent.kind, &sent.entity_id))
                        && unchanged_since(&graph, sent)
                })
                .map(Tombstone::key)
                .collect::<Vec<EntityKey>>();
            TombstoneLedger::new(&mut graph).mark_pushed(&confirmed);
            confirmed
        };

        report.tombstones_pushed += confirmed.len();
        let missing = pending.len() - confirmed.len();
        if missing > 0 {
            report.error(
                phase,
                None,
                format!("{missing} tombstones not acknowledged, kept for the next pass"),
            );
        }
        debug!("Pushed {} tombstones", confirmed.len());
        self.persist(phase, report).await;
    }

    async fn apply_remote_tombstones(
        &self,
        transport: &BatchTransport<'_, R>,
        report: &mut SyncReport,
    ) {
        let records = match transport.fetch_all(TOMBSTONE_RECORD_TYPE).await {
            Ok(records) => records,
            Err(error) => {
                report.error(SyncPhase::ApplyTombstones, None, error);
                return;
            }
        };

        let mut tombstones = Vec::with_capacity(records.len());
        for record in &records {
            match decode_tombstone(record) {
                Ok(tombstone) => tombstones.push(tombstone),
                Err(error) => {
                    warn!("Skipping undecodable tombstone: {error}");
                    report.tombstones_skipped += 1;
                }
            }
        }

        let mut graph = self.graph.lock().await;
        let applied = TombstoneLedger::new(&mut graph).apply_remote(&tombstones, now_millis());
        report.tombstones_applied += applied.learned;
        report.entities_removed += applied.removed;
        if applied.learned > 0 {
            info!(
                "Applied {} remote tombstones, removed {} entities, cascaded {}",
                applied.learned,
                applied.removed,
                applied.cascaded.len()
            );
        }
    }

    /// Fetch every type concurrently, then merge in dependency order so
    /// references resolve against entities merged earlier in the pass.
    async fn fetch_and_merge(&self, transport: &BatchTransport<'_, R>, report: &mut SyncReport) {
        let (trailers, vehicles, checklists, drive_logs, items) = tokio::join!(
            Reconciler::<Trailer>::fetch(transport),
            Reconciler::<Vehicle>::fetch(transport),
            Reconciler::<Checklist>::fetch(transport),
            Reconciler::<DriveLog>::fetch(transport),
            Reconciler::<ChecklistItem>::fetch(transport),
        );

        let mut graph = self.graph.lock().await;
        let mut ctx = MergeContext::default();
        merge_kind::<Trailer>(&mut graph, trailers, &mut ctx, report);
        merge_kind::<Vehicle>(&mut graph, vehicles, &mut ctx, report);
        merge_kind::<Checklist>(&mut graph, checklists, &mut ctx, report);
        merge_kind::<DriveLog>(&mut graph, drive_logs, &mut ctx, report);
        merge_kind::<ChecklistItem>(&mut graph, items, &mut ctx, report);
    }

    /// Write the graph's accumulated changes; on failure they are kept for
    /// the next save.
    async fn persist(&self, phase: SyncPhase, report: &mut SyncReport) {
        let mut graph = self.graph.lock().await;
        let changes = graph.take_changes();
        if changes.is_empty() {
            return;
        }
        if let Err(error) = self.local.save_changes(&graph, &changes).await {
            graph.restore_changes(changes);
            report.error(phase, None, error);
        }
    }

    async fn push_entities(&self, transport: &BatchTransport<'_, R>, report: &mut SyncReport) {
        self.push_kind::<Trailer>(transport, report).await;
        self.push_kind::<Vehicle>(transport, report).await;
        self.push_kind::<Checklist>(transport, report).await;
        self.push_kind::<DriveLog>(transport, report).await;
        self.push_kind::<ChecklistItem>(transport, report).await;
        self.persist(SyncPhase::Push, report).await;
    }

    async fn push_kind<E: SyncEntity>(
        &self,
        transport: &BatchTransport<'_, R>,
        report: &mut SyncReport,
    ) {
        let plan = {
            let graph = self.graph.lock().await;
            Reconciler::<E>::plan_push(
                &graph,
                self.options.force_full_push,
                self.options.max_asset_bytes,
            )
        };
        if plan.is_empty() {
            return;
        }

        match Reconciler::<E>::push(transport, &plan).await {
            Ok(ack) => {
                let cleared = {
                    let mut graph = self.graph.lock().await;
                    Reconciler::<E>::acknowledge(&mut graph, &plan, &ack)
                };
                debug!(
                    "Pushed {} of {} {} records, {cleared} no longer pending",
                    ack.acked.len(),
                    plan.len(),
                    E::KIND
                );
                let entry = report.kind_mut(E::KIND);
                entry.pushed += ack.acked.len();
                entry.push_failures += ack.failures.len();
            }
            Err(error) => report.error(SyncPhase::Push, Some(E::KIND), error),
        }
    }
}

fn merge_kind<E: SyncEntity>(
    graph: &mut LocalGraph,
    fetched: std::result::Result<Vec<Record>, TransportError>,
    ctx: &mut MergeContext,
    report: &mut SyncReport,
) {
    let records = match fetched {
        Ok(records) => records,
        Err(error) => {
            report.error(SyncPhase::Fetch, Some(E::KIND), error);
            return;
        }
    };

    let outcome = Reconciler::<E>::merge(graph, &records, ctx);
    let entry = report.kind_mut(E::KIND);
    entry.fetched += outcome.fetched;
    entry.created += outcome.created;
    entry.updated += outcome.updated;
    entry.suppressed += outcome.suppressed;
    entry.skipped += outcome.errors.len();
    report.conflicts.extend(outcome.conflicts);
}

/// The tombstone was not re-deleted while its push was in flight.
fn unchanged_since(graph: &LocalGraph, sent: &Tombstone) -> bool {
    graph
        .tombstone(sent.kind, &sent.entity_id)
        .is_some_and(|current| current.deleted_at == sent.deleted_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConflictWinner, VehicleType};
    use crate::services::DatabaseService;
    use crate::sync::memory::MemoryRemoteStore;
    use pretty_assertions::assert_eq;

    type Engine = SyncEngine<DatabaseService, MemoryRemoteStore>;

    async fn device(remote: &MemoryRemoteStore) -> Engine {
        let local = DatabaseService::open_in_memory().await.unwrap();
        let graph = local.load_graph().await.unwrap();
        SyncEngine::new(
            Arc::new(Mutex::new(graph)),
            Arc::new(local),
            Arc::new(remote.clone()),
            SyncOptions::default(),
        )
    }

    async fn edit<T>(engine: &Engine, change: impl FnOnce(&mut LocalGraph) -> T) -> T {
        let mut graph = engine.graph().lock().await;
        change(&mut graph)
    }

    fn zone() -> String {
        SyncOptions::default().zone
    }

    /// A truck with a hitched trailer, one drive log and a two-item checklist.
    async fn seed(engine: &Engine) -> (Vehicle, Trailer) {
        edit(engine, |graph| {
            let trailer = Trailer::new();
            let mut vehicle = Vehicle::new(VehicleType::Truck);
            vehicle.plate = "ABC-1".to_string();
            vehicle.trailer_id = Some(trailer.id);
            let log = DriveLog::new(vehicle.id);
            let mut checklist = Checklist::new(VehicleType::Truck, "Pre-trip");
            checklist.vehicle_id = Some(vehicle.id);
            graph.insert(ChecklistItem::new(checklist.id, 0, "Brakes", "Air pressure"));
            graph.insert(ChecklistItem::new(checklist.id, 1, "Lights", "Indicators"));
            graph.insert(trailer.clone());
            graph.insert(vehicle.clone());
            graph.insert(log);
            graph.insert(checklist);
            (vehicle, trailer)
        })
        .await
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_pass_pushes_everything_and_second_pass_nothing() {
        let remote = MemoryRemoteStore::new();
        let device_a = device(&remote).await;
        seed(&device_a).await;

        let first = device_a.perform_full_sync().await.unwrap();
        assert!(first.is_clean(), "{:?}", first.errors);
        assert_eq!(first.total_pushed(), 6);
        assert_eq!(remote.count(&zone(), "ChecklistItem").await, 2);

        let before = edit(&device_a, |graph| graph.vehicles().cloned().collect::<Vec<_>>()).await;
        let second = device_a.perform_full_sync().await.unwrap();
        let after = edit(&device_a, |graph| graph.vehicles().cloned().collect::<Vec<_>>()).await;

        assert!(second.is_clean());
        assert_eq!(second.total_pushed(), 0);
        assert_eq!(second.total_fetched(), 6);
        assert_eq!(before, after);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_device_receives_graph_with_links() {
        let remote = MemoryRemoteStore::new();
        let device_a = device(&remote).await;
        let device_b = device(&remote).await;
        let (vehicle, trailer) = seed(&device_a).await;
        device_a.perform_full_sync().await.unwrap();

        let report = device_b.perform_full_sync().await.unwrap();

        assert_eq!(report.total_fetched(), 6);
        assert_eq!(report.total_pushed(), 0);
        let graph = device_b.graph().lock().await;
        let received = graph.get::<Vehicle>(&vehicle.id).unwrap();
        assert_eq!(received.plate, "ABC-1");
        assert_eq!(received.trailer_id, Some(trailer.id));
        assert!(!received.needs_push);
        assert_eq!(graph.logs_of(&vehicle.id).len(), 1);
        let checklist = graph.checklists().next().unwrap();
        assert_eq!(checklist.vehicle_id, Some(vehicle.id));
        assert_eq!(graph.items_of(&checklist.id).len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn newer_remote_edit_overwrites_whole_record() {
        let remote = MemoryRemoteStore::new();
        let device_a = device(&remote).await;
        let device_b = device(&remote).await;
        let (vehicle, _) = seed(&device_a).await;
        device_a.perform_full_sync().await.unwrap();
        device_b.perform_full_sync().await.unwrap();
        let t0 = vehicle.last_modified;

        edit(&device_a, |graph| {
            let v = graph.get_mut::<Vehicle>(&vehicle.id).unwrap();
            v.plate = "XYZ-9".to_string();
            v.last_modified = t0 + 20;
            v.needs_push = true;
        })
        .await;
        device_a.perform_full_sync().await.unwrap();

        edit(&device_b, |graph| {
            let v = graph.get_mut::<Vehicle>(&vehicle.id).unwrap();
            v.color = "Red".to_string();
            v.last_modified = t0 + 10;
            v.needs_push = true;
        })
        .await;
        let report = device_b.perform_full_sync().await.unwrap();

        let graph = device_b.graph().lock().await;
        let merged = graph.get::<Vehicle>(&vehicle.id).unwrap();
        assert_eq!(merged.plate, "XYZ-9");
        assert_eq!(merged.color, "");
        assert_eq!(merged.last_modified, t0 + 20);
        assert_eq!(report.kind(EntityKind::Vehicle).unwrap().pushed, 0);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].winner, ConflictWinner::Remote);
        drop(graph);

        let logged = device_b.local.list_conflicts(10).await.unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].entity_id, vehicle.id.to_string());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn equal_timestamps_keep_local_scalars() {
        let remote = MemoryRemoteStore::new();
        let device_a = device(&remote).await;
        let device_b = device(&remote).await;
        let (vehicle, _) = seed(&device_a).await;
        device_a.perform_full_sync().await.unwrap();
        device_b.perform_full_sync().await.unwrap();
        let stamp = vehicle.last_modified + 5;

        for (engine, plate) in [(&device_a, "FROM-A"), (&device_b, "FROM-B")] {
            edit(engine, |graph| {
                let v = graph.get_mut::<Vehicle>(&vehicle.id).unwrap();
                v.plate = plate.to_string();
                v.last_modified = stamp;
                v.needs_push = true;
            })
            .await;
        }
        device_a.perform_full_sync().await.unwrap();
        let report = device_b.perform_full_sync().await.unwrap();

        let graph = device_b.graph().lock().await;
        assert_eq!(graph.get::<Vehicle>(&vehicle.id).unwrap().plate, "FROM-B");
        assert!(report.conflicts.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_delete_beats_stale_local_copy_and_cascades_to_new_children() {
        let remote = MemoryRemoteStore::new();
        let device_a = device(&remote).await;
        let device_b = device(&remote).await;
        let (vehicle, _) = seed(&device_a).await;
        device_a.perform_full_sync().await.unwrap();
        device_b.perform_full_sync().await.unwrap();

        edit(&device_a, |graph| {
            TombstoneLedger::new(graph).delete_cascade(EntityKind::Vehicle, vehicle.id, now_millis());
        })
        .await;
        let deleted = device_a.perform_full_sync().await.unwrap();
        assert_eq!(deleted.tombstones_pushed, 5);
        assert_eq!(remote.count(&zone(), "Vehicle").await, 0);

        let late_log = edit(&device_b, |graph| {
            let v = graph.get_mut::<Vehicle>(&vehicle.id).unwrap();
            v.notes = "edited offline".to_string();
            v.touch();
            let log = DriveLog::new(vehicle.id);
            graph.insert(log.clone());
            log
        })
        .await;
        let report = device_b.perform_full_sync().await.unwrap();

        assert!(report.is_clean(), "{:?}", report.errors);
        assert_eq!(report.tombstones_applied, 5);
        assert_eq!(report.tombstones_pushed, 1);
        let graph = device_b.graph().lock().await;
        assert!(graph.get::<Vehicle>(&vehicle.id).is_none());
        assert!(graph.get::<DriveLog>(&late_log.id).is_none());
        assert_eq!(graph.len_of(EntityKind::ChecklistItem), 0);
        drop(graph);

        assert_eq!(remote.count(&zone(), "Vehicle").await, 0);
        assert_eq!(remote.count(&zone(), "DriveLog").await, 0);
        assert!(remote
            .record(&zone(), &RecordId::for_tombstone(&late_log.id))
            .await
            .is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tombstoned_remote_record_is_never_materialized() {
        let remote = MemoryRemoteStore::new();
        let zombie = Vehicle::new(VehicleType::Van);
        remote.put(&zone(), zombie.encode()).await;
        remote
            .put(
                &zone(),
                encode_tombstone(&Tombstone::new(EntityKind::Vehicle, zombie.id, 1)),
            )
            .await;

        let fresh = device(&remote).await;
        let report = fresh.perform_full_sync().await.unwrap();

        assert_eq!(report.tombstones_applied, 1);
        assert!(fresh
            .graph()
            .lock()
            .await
            .get::<Vehicle>(&zombie.id)
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_tombstone_push_is_retried_next_pass() {
        let remote = MemoryRemoteStore::new();
        remote.create_zone(&zone()).await.unwrap();
        let engine = device(&remote).await;
        let trailer = Trailer::new();
        edit(&engine, |graph| {
            graph.insert(trailer.clone());
            TombstoneLedger::new(graph).delete_cascade(EntityKind::Trailer, trailer.id, 1);
        })
        .await;

        remote
            .fail_next(TransportError::Unavailable("offline".to_string()))
            .await;
        let failed = engine.push_pending_tombstones().await;
        assert_eq!(failed.tombstones_pushed, 0);
        assert_eq!(failed.errors[0].phase, SyncPhase::PushTombstones);
        assert!(!engine
            .graph()
            .lock()
            .await
            .tombstone(EntityKind::Trailer, &trailer.id)
            .unwrap()
            .pushed);

        let retried = engine.perform_full_sync().await.unwrap();
        assert_eq!(retried.tombstones_pushed, 1);
        let graph = engine.graph().lock().await;
        assert!(graph.tombstone(EntityKind::Trailer, &trailer.id).unwrap().pushed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_entity_delete_keeps_tombstone_pending_until_record_is_gone() {
        let remote = MemoryRemoteStore::new();
        let engine = device(&remote).await;
        let trailer = edit(&engine, |graph| {
            let trailer = Trailer::new();
            graph.insert(trailer.clone());
            trailer
        })
        .await;
        engine.perform_full_sync().await.unwrap();
        assert_eq!(remote.count(&zone(), "Trailer").await, 1);

        edit(&engine, |graph| {
            TombstoneLedger::new(graph).delete_cascade(EntityKind::Trailer, trailer.id, now_millis());
        })
        .await;
        let entity_record = RecordId::for_entity(EntityKind::Trailer, &trailer.id);
        for _ in 0..2 {
            remote
                .fail_call_including(
                    entity_record.clone(),
                    TransportError::Unavailable("blip".to_string()),
                )
                .await;
        }

        let failed = engine.perform_full_sync().await.unwrap();
        assert_eq!(failed.tombstones_pushed, 0);
        assert_eq!(
            failed
                .errors
                .iter()
                .map(|error| error.phase)
                .collect::<Vec<_>>(),
            vec![SyncPhase::PushTombstones, SyncPhase::PushCascadedTombstones]
        );
        assert_eq!(remote.count(&zone(), TOMBSTONE_RECORD_TYPE).await, 1);
        assert_eq!(remote.count(&zone(), "Trailer").await, 1);
        assert!(!engine
            .graph()
            .lock()
            .await
            .tombstone(EntityKind::Trailer, &trailer.id)
            .unwrap()
            .pushed);

        let retried = engine.perform_full_sync().await.unwrap();
        assert!(retried.is_clean(), "{:?}", retried.errors);
        assert_eq!(retried.tombstones_pushed, 1);
        assert_eq!(remote.count(&zone(), "Trailer").await, 0);
        let graph = engine.graph().lock().await;
        assert!(graph.tombstone(EntityKind::Trailer, &trailer.id).unwrap().pushed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_fetch_of_one_type_leaves_the_others_running() {
        let remote = MemoryRemoteStore::new();
        let device_a = device(&remote).await;
        let device_b = device(&remote).await;
        let (vehicle, _) = seed(&device_a).await;
        device_a.perform_full_sync().await.unwrap();

        let own = edit(&device_b, |graph| {
            let own = Vehicle::new(VehicleType::Van);
            graph.insert(own.clone());
            own
        })
        .await;
        remote
            .fail_query("Trailer", TransportError::Unavailable("timeout".to_string()))
            .await;
        let report = device_b.perform_full_sync().await.unwrap();

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].phase, SyncPhase::Fetch);
        assert_eq!(report.errors[0].kind, Some(EntityKind::Trailer));
        let fetched = |kind: EntityKind| report.kind(kind).unwrap().fetched;
        assert_eq!(fetched(EntityKind::Trailer), 0);
        assert_eq!(fetched(EntityKind::Vehicle), 1);
        assert_eq!(fetched(EntityKind::Checklist), 1);
        assert_eq!(fetched(EntityKind::DriveLog), 1);
        assert_eq!(fetched(EntityKind::ChecklistItem), 2);
        assert_eq!(report.kind(EntityKind::Vehicle).unwrap().pushed, 1);

        let graph = device_b.graph().lock().await;
        assert_eq!(graph.len_of(EntityKind::Trailer), 0);
        assert_eq!(graph.get::<Vehicle>(&vehicle.id).unwrap().trailer_id, None);
        assert_eq!(graph.logs_of(&vehicle.id).len(), 1);
        assert!(!graph.get::<Vehicle>(&own.id).unwrap().needs_push);
        drop(graph);
        assert_eq!(remote.count(&zone(), "Vehicle").await, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_failing_step_does_not_stop_the_pass() {
        let remote = MemoryRemoteStore::new();
        let engine = device(&remote).await;
        seed(&engine).await;

        remote
            .fail_next(TransportError::Unavailable("timeout".to_string()))
            .await;
        let report = engine.perform_full_sync().await.unwrap();

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].phase, SyncPhase::ApplyTombstones);
        assert_eq!(report.total_pushed(), 6);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_record_stays_pending() {
        let remote = MemoryRemoteStore::new();
        let engine = device(&remote).await;
        let (vehicle, trailer) = seed(&engine).await;
        remote
            .reject_record(RecordId::for_entity(EntityKind::Trailer, &trailer.id))
            .await;

        let report = engine.perform_full_sync().await.unwrap();

        assert_eq!(report.kind(EntityKind::Trailer).unwrap().push_failures, 1);
        assert_eq!(report.kind(EntityKind::Vehicle).unwrap().pushed, 1);
        let graph = engine.graph().lock().await;
        assert!(graph.get::<Trailer>(&trailer.id).unwrap().needs_push);
        assert!(!graph.get::<Vehicle>(&vehicle.id).unwrap().needs_push);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_pass_is_refused() {
        let remote = MemoryRemoteStore::new();
        let engine = device(&remote).await;

        let _held = engine.in_progress.lock().await;
        assert!(matches!(
            engine.perform_full_sync().await,
            Err(Error::SyncInProgress)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn spawned_tombstone_push_reports_through_handle() {
        let remote = MemoryRemoteStore::new();
        let engine = device(&remote).await;
        let (vehicle, _) = seed(&engine).await;
        engine.perform_full_sync().await.unwrap();

        edit(&engine, |graph| {
            TombstoneLedger::new(graph).delete_cascade(EntityKind::Vehicle, vehicle.id, now_millis());
        })
        .await;
        let report = engine.spawn_tombstone_push().await.unwrap();

        assert_eq!(report.tombstones_pushed, 5);
        assert_eq!(report.total_pushed(), 0);
        assert_eq!(remote.count(&zone(), TOMBSTONE_RECORD_TYPE).await, 5);
        assert_eq!(remote.count(&zone(), "Vehicle").await, 0);
    }
}
