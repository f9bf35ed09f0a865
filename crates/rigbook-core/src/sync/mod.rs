//! Multi-device sync engine.
//!
//! Replicas exchange flat records through a shared [`RemoteStore`] zone.
//! Conflicts resolve last-write-wins on `lastModified`, deletions travel as
//! tombstone records, and [`SyncEngine::perform_full_sync`] runs the whole
//! protocol for one replica.

mod codec;
mod compactor;
mod ledger;
mod libsql_remote;
mod memory;
mod orchestrator;
mod reconciler;
mod record;
mod remote;
mod transport;

pub use codec::{
    decode, entity_id_of, DecodeError, Decoded, MergeContext, SyncEntity, FIELD_LAST_MODIFIED,
};
pub use compactor::{compact, DEFAULT_MAX_ASSET_BYTES};
pub use ledger::{decode_tombstone, encode_tombstone, AppliedTombstones, TombstoneLedger};
pub use libsql_remote::LibSqlRemoteStore;
pub use memory::MemoryRemoteStore;
pub use orchestrator::{KindReport, PhaseError, SyncEngine, SyncPhase, SyncReport};
pub use reconciler::{MergeOutcome, PushAck, PushPlan, Reconciler};
pub use record::{FieldValue, Record, RecordId, SavePolicy, TOMBSTONE_RECORD_TYPE};
pub use remote::{
    BatchOutcome, RecordError, RecordFailure, RemoteStore, TransportError, DEFAULT_BATCH_LIMIT,
};
pub use transport::BatchTransport;
