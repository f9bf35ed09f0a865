//! In-process remote store.
//!
//! Cloning shares the underlying state, so several engines can sync
//! against one instance the way devices share a cloud zone. Faults can be
//! injected per call or per record.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::record::{FieldValue, Record, RecordId, SavePolicy};
use super::remote::{
    BatchOutcome, RecordError, RecordFailure, RemoteStore, TransportError, DEFAULT_BATCH_LIMIT,
};

#[derive(Debug, Default)]
struct MemoryState {
    zones: BTreeMap<String, BTreeMap<RecordId, Record>>,
    pending_faults: VecDeque<TransportError>,
    query_faults: HashMap<String, VecDeque<TransportError>>,
    call_faults: HashMap<RecordId, VecDeque<TransportError>>,
    rejected: HashSet<RecordId>,
    save_calls: usize,
    delete_calls: usize,
}

impl MemoryState {
    fn take_fault<'a>(
        &mut self,
        mut ids: impl Iterator<Item = &'a RecordId>,
    ) -> Option<TransportError> {
        if let Some(error) = self.pending_faults.pop_front() {
            return Some(error);
        }
        let id = ids.find(|id| {
            self.call_faults
                .get(*id)
                .is_some_and(|faults| !faults.is_empty())
        })?;
        self.call_faults.get_mut(id)?.pop_front()
    }
}

#[derive(Debug, Clone)]
pub struct MemoryRemoteStore {
    state: Arc<Mutex<MemoryState>>,
    batch_limit: usize,
    validate_references: bool,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    /// An empty store with no zones provisioned.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            batch_limit: DEFAULT_BATCH_LIMIT,
            validate_references: false,
        }
    }

    #[must_use]
    pub const fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    /// Reject saves whose reference fields point at records not in the zone.
    #[must_use]
    pub const fn with_reference_validation(mut self) -> Self {
        self.validate_references = true;
        self
    }

    /// Fail the next query, save or delete with `error`.
    pub async fn fail_next(&self, error: TransportError) {
        self.state.lock().await.pending_faults.push_back(error);
    }

    /// Fail the next query for `record_type` with `error`.
    pub async fn fail_query(&self, record_type: &str, error: TransportError) {
        self.state
            .lock()
            .await
            .query_faults
            .entry(record_type.to_string())
            .or_default()
            .push_back(error);
    }

    /// Fail the next save or delete call whose batch includes `id`.
    pub async fn fail_call_including(&self, id: RecordId, error: TransportError) {
        self.state
            .lock()
            .await
            .call_faults
            .entry(id)
            .or_default()
            .push_back(error);
    }

    /// Reject every future save of `id`.
    pub async fn reject_record(&self, id: RecordId) {
        self.state.lock().await.rejected.insert(id);
    }

    /// Store a record directly, bypassing validation.
    pub async fn put(&self, zone: &str, record: Record) {
        self.state
            .lock()
            .await
            .zones
            .entry(zone.to_string())
            .or_default()
            .insert(record.record_id.clone(), record.without_nulls());
    }

    pub async fn record(&self, zone: &str, id: &RecordId) -> Option<Record> {
        let state = self.state.lock().await;
        state.zones.get(zone)?.get(id).cloned()
    }

    pub async fn count(&self, zone: &str, record_type: &str) -> usize {
        let state = self.state.lock().await;
        state.zones.get(zone).map_or(0, |records| {
            records
                .values()
                .filter(|record| record.record_type == record_type)
                .count()
        })
    }

    pub async fn save_calls(&self) -> usize {
        self.state.lock().await.save_calls
    }

    pub async fn delete_calls(&self) -> usize {
        self.state.lock().await.delete_calls
    }

    fn check_limit(&self, size: usize) -> Result<(), TransportError> {
        if size > self.batch_limit {
            return Err(TransportError::LimitExceeded {
                size,
                limit: self.batch_limit,
            });
        }
        Ok(())
    }
}

fn missing_reference(
    record: &Record,
    zone: &BTreeMap<RecordId, Record>,
) -> Option<RecordError> {
    record.fields.iter().find_map(|(field, value)| match value {
        FieldValue::Reference(target) if !zone.contains_key(target) => {
            Some(RecordError::MissingReference {
                field: field.clone(),
                target: target.clone(),
            })
        }
        _ => None,
    })
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    async fn create_zone(&self, zone: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.zones.entry(zone.to_string()).or_default();
        Ok(())
    }

    async fn query(&self, zone: &str, record_type: &str) -> Result<Vec<Record>, TransportError> {
        let mut state = self.state.lock().await;
        if let Some(error) = state.pending_faults.pop_front() {
            return Err(error);
        }
        if let Some(error) = state
            .query_faults
            .get_mut(record_type)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        let records = state
            .zones
            .get(zone)
            .ok_or_else(|| TransportError::ZoneNotFound(zone.to_string()))?;
        Ok(records
            .values()
            .filter(|record| record.record_type == record_type)
            .cloned()
            .collect())
    }

    async fn save(
        &self,
        zone: &str,
        records: &[Record],
        policy: SavePolicy,
    ) -> Result<BatchOutcome, TransportError> {
        self.check_limit(records.len())?;
        let mut state = self.state.lock().await;
        state.save_calls += 1;
        if let Some(error) = state.take_fault(records.iter().map(|record| &record.record_id)) {
            return Err(error);
        }

        let rejected = state.rejected.clone();
        let stored = state
            .zones
            .get_mut(zone)
            .ok_or_else(|| TransportError::ZoneNotFound(zone.to_string()))?;

        let mut outcome = BatchOutcome::default();
        for record in records {
            let id = record.record_id.clone();
            if rejected.contains(&id) {
                outcome.failed.push(RecordFailure {
                    record_id: id,
                    error: RecordError::Rejected("rejected by fault injection".to_string()),
                });
                continue;
            }

            let next = match (policy, stored.get(&id)) {
                (SavePolicy::ChangedKeys, Some(existing)) => {
                    let mut merged = existing.clone();
                    merged.apply_changes(record);
                    merged
                }
                _ => record.clone().without_nulls(),
            };

            if self.validate_references {
                if let Some(error) = missing_reference(&next, stored) {
                    outcome.failed.push(RecordFailure {
                        record_id: id,
                        error,
                    });
                    continue;
                }
            }

            stored.insert(id.clone(), next);
            outcome.saved.push(id);
        }
        Ok(outcome)
    }

    async fn delete(&self, zone: &str, ids: &[RecordId]) -> Result<BatchOutcome, TransportError> {
        self.check_limit(ids.len())?;
        let mut state = self.state.lock().await;
        state.delete_calls += 1;
        if let Some(error) = state.take_fault(ids.iter()) {
            return Err(error);
        }
        let stored = state
            .zones
            .get_mut(zone)
            .ok_or_else(|| TransportError::ZoneNotFound(zone.to_string()))?;

        let mut outcome = BatchOutcome::default();
        for id in ids {
            if stored.remove(id).is_some() {
                outcome.saved.push(id.clone());
            } else {
                outcome.failed.push(RecordFailure {
                    record_id: id.clone(),
                    error: RecordError::NotFound,
                });
            }
        }
        Ok(outcome)
    }
}
