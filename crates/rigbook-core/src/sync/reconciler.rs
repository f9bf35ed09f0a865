//! Per-type fetch/merge and push, shared by every entity type.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;

use tracing::{debug, warn};

use crate::graph::LocalGraph;
use crate::models::{EntityId, SyncConflict};

use super::codec::{decode, entity_id_of, DecodeError, MergeContext, SyncEntity};
use super::compactor::compact;
use super::record::{FieldValue, Record, RecordId, SavePolicy};
use super::remote::{RecordFailure, RemoteStore, TransportError};
use super::transport::BatchTransport;

/// What merging one type's remote records did to the graph.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Records decoded and merged
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    /// Records ignored because their id is tombstoned
    pub suppressed: usize,
    pub conflicts: Vec<SyncConflict>,
    pub errors: Vec<DecodeError>,
}

/// Records prepared from the graph for one push.
#[derive(Debug, Default)]
pub struct PushPlan {
    base: Vec<Record>,
    deferred: Vec<Record>,
    /// Uncompacted encoding of each entity at planning time
    sent: HashMap<RecordId, (EntityId, Record, Option<Record>)>,
}

impl PushPlan {
    pub fn len(&self) -> usize {
        self.base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }
}

/// Remote acknowledgement of a push.
#[derive(Debug, Default)]
pub struct PushAck {
    /// Records whose every phase was saved
    pub acked: Vec<RecordId>,
    pub failures: Vec<RecordFailure>,
}

pub struct Reconciler<E>(PhantomData<E>);

impl<E: SyncEntity> Reconciler<E> {
    pub async fn fetch<R: RemoteStore + ?Sized>(
        transport: &BatchTransport<'_, R>,
    ) -> Result<Vec<Record>, TransportError> {
        transport.fetch_all(E::KIND.type_tag()).await
    }

    /// Merge fetched records into the graph.
    ///
    /// Tombstoned ids are never materialized. A record that fails to decode
    /// is skipped without creating anything.
    pub fn merge(graph: &mut LocalGraph, records: &[Record], ctx: &mut MergeContext) -> MergeOutcome {
        let tombstoned = graph.tombstoned_ids();
        let mut outcome = MergeOutcome::default();
        let mut seen = HashSet::new();

        for record in records {
            let id = match entity_id_of(record, E::KIND) {
                Ok(id) => id,
                Err(error) => {
                    warn!("Skipping undecodable {} record: {error}", E::KIND);
                    outcome.errors.push(error);
                    continue;
                }
            };
            if tombstoned.contains(&id) {
                debug!("Ignoring {} {id}: tombstoned", E::KIND);
                outcome.suppressed += 1;
                continue;
            }
            seen.insert(id);

            let decoded = match decode::<E>(record, graph.get::<E>(&id), graph, ctx) {
                Ok(decoded) => decoded,
                Err(error) => {
                    warn!("Skipping undecodable {} record: {error}", E::KIND);
                    outcome.errors.push(error);
                    continue;
                }
            };

            outcome.fetched += 1;
            if decoded.created {
                outcome.created += 1;
            } else if decoded.scalars_applied {
                outcome.updated += 1;
            }
            if let Some(conflict) = decoded.conflict {
                debug!(
                    "Conflict on {} {id}: local {} vs remote {}, {} wins",
                    E::KIND,
                    conflict.local_modified,
                    conflict.remote_modified,
                    conflict.winner
                );
                outcome.conflicts.push(conflict);
            }

            if graph.get::<E>(&id) != Some(&decoded.entity) {
                graph.insert(decoded.entity);
            }
        }

        E::after_fetch(graph, ctx, &seen);
        outcome
    }

    /// Encode every pending (or, with `force`, every) live entity.
    pub fn plan_push(graph: &LocalGraph, force: bool, max_asset_bytes: usize) -> PushPlan {
        let tombstoned = graph.tombstoned_ids();
        let mut plan = PushPlan::default();

        for entity in graph.all::<E>() {
            let id = entity.entity_id();
            if !(force || entity.needs_push()) || tombstoned.contains(&id) {
                continue;
            }

            let record = entity.encode();
            let deferred = entity.encode_deferred();

            let mut payload = record.clone();
            compact_assets(&mut payload, max_asset_bytes);
            plan.base.push(payload);
            if let Some(deferred) = &deferred {
                plan.deferred.push(deferred.clone());
            }
            plan.sent
                .insert(record.record_id.clone(), (id, record, deferred));
        }

        plan
    }

    /// Write the plan: base records first, then deferred relationship
    /// fields for the records whose base write landed.
    pub async fn push<R: RemoteStore + ?Sized>(
        transport: &BatchTransport<'_, R>,
        plan: &PushPlan,
    ) -> Result<PushAck, TransportError> {
        if plan.is_empty() {
            return Ok(PushAck::default());
        }

        let base = transport.save_batch(&plan.base, E::SAVE_POLICY).await?;
        let landed = base.saved.iter().collect::<HashSet<_>>();

        let deferred = plan
            .deferred
            .iter()
            .filter(|record| landed.contains(&record.record_id))
            .cloned()
            .collect::<Vec<_>>();
        let linked = transport
            .save_batch(&deferred, SavePolicy::ChangedKeys)
            .await?;
        let linked_ids = linked.saved.iter().collect::<HashSet<_>>();

        let acked = base
            .saved
            .iter()
            .filter(|record_id| {
                plan.sent
                    .get(*record_id)
                    .is_some_and(|(_, _, deferred)| {
                        deferred.is_none() || linked_ids.contains(record_id)
                    })
            })
            .cloned()
            .collect();

        let mut failures = base.failed;
        failures.extend(linked.failed);
        Ok(PushAck { acked, failures })
    }

    /// Clear `needs_push` on acknowledged entities that were not edited
    /// again while the push was in flight. Returns how many were cleared.
    pub fn acknowledge(graph: &mut LocalGraph, plan: &PushPlan, ack: &PushAck) -> usize {
        let mut cleared = 0;
        for record_id in &ack.acked {
            let Some((id, record, deferred)) = plan.sent.get(record_id) else {
                continue;
            };
            let unchanged = graph.get::<E>(id).is_some_and(|entity| {
                entity.needs_push() && entity.encode() == *record && entity.encode_deferred() == *deferred
            });
            if unchanged {
                if let Some(entity) = graph.get_mut::<E>(id) {
                    entity.set_needs_push(false);
                    cleared += 1;
                }
            }
        }
        cleared
    }
}

/// Shrink oversized assets to the transport ceiling. Assets that cannot be
/// decoded are left out of the payload.
fn compact_assets(record: &mut Record, max_bytes: usize) {
    let mut undecodable = Vec::new();
    for (key, value) in &mut record.fields {
        let FieldValue::Asset(bytes) = value else {
            continue;
        };
        if bytes.len() <= max_bytes {
            continue;
        }
        match compact(bytes, max_bytes) {
            Some(compacted) => *bytes = compacted,
            None => undecodable.push(key.clone()),
        }
    }
    for key in undecodable {
        warn!("Leaving undecodable {key} out of {}", record.record_id);
        record.fields.remove(&key);
    }
}
