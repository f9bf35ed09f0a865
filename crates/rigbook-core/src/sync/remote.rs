//! Remote record store abstraction.

use async_trait::async_trait;
use thiserror::Error;

use super::record::{Record, RecordId, SavePolicy};

/// Default per-call record ceiling.
pub const DEFAULT_BATCH_LIMIT: usize = 400;

/// A whole remote call failed; nothing in it was applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("zone {0} does not exist")]
    ZoneNotFound(String),
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    #[error("remote quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("batch of {size} records exceeds the per-call limit of {limit}")]
    LimitExceeded { size: usize, limit: usize },
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Why a single record inside an otherwise accepted batch failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record not found")]
    NotFound,
    #[error("field {field} references missing record {target}")]
    MissingReference { field: String, target: RecordId },
    #[error("record rejected: {0}")]
    Rejected(String),
    /// The call carrying this record failed after earlier calls of the same
    /// batch had gone through.
    #[error("not sent: {0}")]
    Unsent(TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub record_id: RecordId,
    pub error: RecordError,
}

/// Per-record result of a batched save or delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub saved: Vec<RecordId>,
    pub failed: Vec<RecordFailure>,
}

impl BatchOutcome {
    pub fn merge(&mut self, other: Self) {
        self.saved.extend(other.saved);
        self.failed.extend(other.failed);
    }

    /// Mark every id of a call that failed as a whole.
    pub fn fail_all<'a>(
        &mut self,
        ids: impl IntoIterator<Item = &'a RecordId>,
        error: &TransportError,
    ) {
        self.failed.extend(ids.into_iter().map(|id| RecordFailure {
            record_id: id.clone(),
            error: RecordError::Unsent(error.clone()),
        }));
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Failures other than `NotFound`.
    pub fn hard_failures(&self) -> impl Iterator<Item = &RecordFailure> {
        self.failed
            .iter()
            .filter(|failure| failure.error != RecordError::NotFound)
    }
}

/// A namespaced record store shared by every replica.
///
/// Implementations report per-record failures in [`BatchOutcome`] and use
/// [`TransportError`] only when the call as a whole did not happen.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Maximum records accepted by one save or delete call.
    fn batch_limit(&self) -> usize {
        DEFAULT_BATCH_LIMIT
    }

    /// Provision `zone`; succeeds if it already exists.
    async fn create_zone(&self, zone: &str) -> Result<(), TransportError>;

    /// Every record of `record_type` in `zone`.
    async fn query(&self, zone: &str, record_type: &str) -> Result<Vec<Record>, TransportError>;

    async fn save(
        &self,
        zone: &str,
        records: &[Record],
        policy: SavePolicy,
    ) -> Result<BatchOutcome, TransportError>;

    async fn delete(&self, zone: &str, ids: &[RecordId]) -> Result<BatchOutcome, TransportError>;
}
