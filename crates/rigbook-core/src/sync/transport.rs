//! Chunked, partial-success writes against a [`RemoteStore`] zone.

use tracing::{debug, info, warn};

use super::record::{Record, RecordId, SavePolicy};
use super::remote::{BatchOutcome, RemoteStore, TransportError};

/// Batched access to one zone of a remote store.
///
/// Oversized batches are split to the store's per-call limit. When the
/// zone does not exist it is provisioned and the whole batch is retried
/// exactly once; any other failure of the first call is returned as is.
/// A later call that fails marks its records [`RecordError::Unsent`] and the
/// remaining chunks are still sent, so ids saved earlier are not lost.
///
/// [`RecordError::Unsent`]: super::remote::RecordError::Unsent
pub struct BatchTransport<'a, R: ?Sized> {
    remote: &'a R,
    zone: &'a str,
    chunk_limit: Option<usize>,
}

impl<'a, R: RemoteStore + ?Sized> BatchTransport<'a, R> {
    pub const fn new(remote: &'a R, zone: &'a str) -> Self {
        Self {
            remote,
            zone,
            chunk_limit: None,
        }
    }

    /// Chunk below the store's own limit.
    #[must_use]
    pub const fn with_chunk_limit(mut self, limit: Option<usize>) -> Self {
        self.chunk_limit = limit;
        self
    }

    pub async fn save_batch(
        &self,
        records: &[Record],
        policy: SavePolicy,
    ) -> Result<BatchOutcome, TransportError> {
        if records.is_empty() {
            return Ok(BatchOutcome::default());
        }

        match self.save_chunks(records, policy).await {
            Err(TransportError::ZoneNotFound(zone)) => {
                info!("Zone {zone} missing, provisioning before retrying save");
                self.remote.create_zone(self.zone).await?;
                self.save_chunks(records, policy).await
            }
            result => result,
        }
    }

    pub async fn delete_batch(&self, ids: &[RecordId]) -> Result<BatchOutcome, TransportError> {
        if ids.is_empty() {
            return Ok(BatchOutcome::default());
        }

        match self.delete_chunks(ids).await {
            Err(TransportError::ZoneNotFound(zone)) => {
                info!("Zone {zone} missing, provisioning before retrying delete");
                self.remote.create_zone(self.zone).await?;
                self.delete_chunks(ids).await
            }
            result => result,
        }
    }

    /// Every record of `record_type`; a zone nobody has written to yet is empty.
    pub async fn fetch_all(&self, record_type: &str) -> Result<Vec<Record>, TransportError> {
        match self.remote.query(self.zone, record_type).await {
            Err(TransportError::ZoneNotFound(zone)) => {
                debug!("Zone {zone} not provisioned yet, nothing to fetch for {record_type}");
                Ok(Vec::new())
            }
            result => result,
        }
    }

    fn chunk_size(&self) -> usize {
        let limit = self.remote.batch_limit();
        self.chunk_limit.map_or(limit, |cap| cap.min(limit)).max(1)
    }

    async fn save_chunks(
        &self,
        records: &[Record],
        policy: SavePolicy,
    ) -> Result<BatchOutcome, TransportError> {
        let mut outcome = BatchOutcome::default();
        for (index, chunk) in records.chunks(self.chunk_size()).enumerate() {
            match self.remote.save(self.zone, chunk, policy).await {
                Ok(part) => {
                    log_failures("save", &part);
                    outcome.merge(part);
                }
                Err(error) if index == 0 => return Err(error),
                Err(error) => {
                    warn!("Remote save of {} records failed: {error}", chunk.len());
                    outcome.fail_all(chunk.iter().map(|record| &record.record_id), &error);
                }
            }
        }
        Ok(outcome)
    }

    async fn delete_chunks(&self, ids: &[RecordId]) -> Result<BatchOutcome, TransportError> {
        let mut outcome = BatchOutcome::default();
        for (index, chunk) in ids.chunks(self.chunk_size()).enumerate() {
            match self.remote.delete(self.zone, chunk).await {
                Ok(part) => {
                    log_failures("delete", &part);
                    outcome.merge(part);
                }
                Err(error) if index == 0 => return Err(error),
                Err(error) => {
                    warn!("Remote delete of {} records failed: {error}", chunk.len());
                    outcome.fail_all(chunk, &error);
                }
            }
        }
        Ok(outcome)
    }
}

fn log_failures(operation: &str, outcome: &BatchOutcome) {
    for failure in &outcome.failed {
        warn!(
            "Remote {operation} of {} failed: {}",
            failure.record_id, failure.error
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::memory::MemoryRemoteStore;
    use crate::sync::remote::RecordError;

    const ZONE: &str = "garage";

    fn records(count: usize) -> Vec<Record> {
        (0..count)
            .map(|index| Record::new("Trailer", RecordId::from(format!("Trailer_{index}").as_str())))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn save_batch_chunks_to_limit() {
        let store = MemoryRemoteStore::new().with_batch_limit(2);
        store.create_zone(ZONE).await.unwrap();
        let transport = BatchTransport::new(&store, ZONE);

        let outcome = transport
            .save_batch(&records(5), SavePolicy::AllKeys)
            .await
            .unwrap();

        assert_eq!(outcome.saved.len(), 5);
        assert_eq!(store.save_calls().await, 3);
        assert_eq!(store.count(ZONE, "Trailer").await, 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn chunk_limit_only_lowers_the_store_limit() {
        let store = MemoryRemoteStore::new().with_batch_limit(3);
        store.create_zone(ZONE).await.unwrap();

        BatchTransport::new(&store, ZONE)
            .with_chunk_limit(Some(1))
            .save_batch(&records(3), SavePolicy::AllKeys)
            .await
            .unwrap();
        assert_eq!(store.save_calls().await, 3);

        BatchTransport::new(&store, ZONE)
            .with_chunk_limit(Some(50))
            .save_batch(&records(3), SavePolicy::AllKeys)
            .await
            .unwrap();
        assert_eq!(store.save_calls().await, 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn save_batch_provisions_zone_and_retries_once() {
        let store = MemoryRemoteStore::new();
        let transport = BatchTransport::new(&store, ZONE);

        let outcome = transport
            .save_batch(&records(3), SavePolicy::AllKeys)
            .await
            .unwrap();

        assert_eq!(outcome.saved.len(), 3);
        assert_eq!(store.save_calls().await, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_zone_failure_surfaces() {
        let store = MemoryRemoteStore::new();
        for _ in 0..2 {
            store
                .fail_next(TransportError::ZoneNotFound(ZONE.to_string()))
                .await;
        }
        let transport = BatchTransport::new(&store, ZONE);

        let result = transport.delete_batch(&[RecordId::from("Trailer_a")]).await;

        assert_eq!(result, Err(TransportError::ZoneNotFound(ZONE.to_string())));
        assert_eq!(store.delete_calls().await, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn other_transport_errors_are_not_retried() {
        let store = MemoryRemoteStore::new();
        store.create_zone(ZONE).await.unwrap();
        store
            .fail_next(TransportError::QuotaExceeded("daily writes".to_string()))
            .await;
        let transport = BatchTransport::new(&store, ZONE);

        let result = transport.save_batch(&records(1), SavePolicy::AllKeys).await;

        assert!(matches!(result, Err(TransportError::QuotaExceeded(_))));
        assert_eq!(store.save_calls().await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_later_chunk_keeps_earlier_saves() {
        let store = MemoryRemoteStore::new().with_batch_limit(2);
        store.create_zone(ZONE).await.unwrap();
        let reset = TransportError::Unavailable("connection reset".to_string());
        store
            .fail_call_including(RecordId::from("Trailer_2"), reset.clone())
            .await;
        let transport = BatchTransport::new(&store, ZONE);

        let outcome = transport
            .save_batch(&records(5), SavePolicy::AllKeys)
            .await
            .unwrap();

        assert_eq!(
            outcome.saved,
            vec![
                RecordId::from("Trailer_0"),
                RecordId::from("Trailer_1"),
                RecordId::from("Trailer_4"),
            ]
        );
        assert_eq!(outcome.failed.len(), 2);
        assert_eq!(outcome.failed[0].record_id, RecordId::from("Trailer_2"));
        assert_eq!(outcome.failed[1].error, RecordError::Unsent(reset));
        assert_eq!(store.save_calls().await, 3);
        assert_eq!(store.count(ZONE, "Trailer").await, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetch_from_missing_zone_is_empty() {
        let store = MemoryRemoteStore::new();
        let transport = BatchTransport::new(&store, ZONE);
        assert!(transport.fetch_all("Vehicle").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_batch_reports_each_failure() {
        let store = MemoryRemoteStore::new();
        store.create_zone(ZONE).await.unwrap();
        store.put(ZONE, records(1).remove(0)).await;
        let transport = BatchTransport::new(&store, ZONE);

        let outcome = transport
            .delete_batch(&[RecordId::from("Trailer_0"), RecordId::from("Trailer_9")])
            .await
            .unwrap();

        assert_eq!(outcome.saved, vec![RecordId::from("Trailer_0")]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].error, RecordError::NotFound);
    }
}
