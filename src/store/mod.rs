//! Document Store
//!
//! Persistence seam for devices, records, batches, auth logs and proposals.
//! [`MemoryStore`] is the in-process implementation; a database-backed
//! store implements the same trait.

pub mod memory;
pub mod models;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::chain::{ChainId, ChainReceipt};

pub use memory::MemoryStore;
pub use models::{
    AnchorBatchRecord, Approval, AuthLog, ChainResult, DataRecord, Device, Proposal,
    ProposalStatus, RecordCounts, RecordStatus, Rejection, Signer,
};

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No entity with this key.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Entity kind.
        kind: &'static str,
        /// Key.
        id: String,
    },
    /// An entity with this key already exists.
    #[error("{kind} {id} already exists")]
    Conflict {
        /// Entity kind.
        kind: &'static str,
        /// Key.
        id: String,
    },
    /// Update based on an outdated revision.
    #[error("{kind} {id} was modified concurrently")]
    Stale {
        /// Entity kind.
        kind: &'static str,
        /// Key.
        id: String,
    },
    /// Backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound { kind, id: id.into() }
    }

    pub(crate) fn conflict(kind: &'static str, id: impl Into<String>) -> Self {
        StoreError::Conflict { kind, id: id.into() }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence operations used by the service.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    // -------------------------------------------------------------------------
    // Devices
    // -------------------------------------------------------------------------

    /// Insert a device; `Conflict` if the id is taken.
    async fn insert_device(&self, device: Device) -> StoreResult<()>;

    /// Look up a device.
    async fn get_device(&self, device_id: &str) -> StoreResult<Option<Device>>;

    /// All devices, ordered by id.
    async fn list_devices(&self) -> StoreResult<Vec<Device>>;

    /// Replace a stored device.
    async fn update_device(&self, device: Device) -> StoreResult<()>;

    /// Set `last_authenticated`.
    async fn touch_authenticated(&self, device_id: &str, at: DateTime<Utc>) -> StoreResult<()>;

    /// Record the on-chain registration transaction of a device.
    async fn set_registration_tx(&self, device_id: &str, tx_hash: &str) -> StoreResult<()>;

    /// Increment `total_data_submitted`, returning the new value.
    async fn increment_data_count(&self, device_id: &str) -> StoreResult<u64>;

    // -------------------------------------------------------------------------
    // Records
    // -------------------------------------------------------------------------

    /// Store a submitted record.
    async fn insert_record(&self, record: DataRecord) -> StoreResult<()>;

    /// Records waiting for a batch, in submission order.
    async fn pending_records(&self) -> StoreResult<Vec<DataRecord>>;

    /// Atomically move every pending record to `Claimed(batch_id)`, assigning
    /// `batch_index` in submission order. Returns the claimed records.
    async fn claim_pending(&self, batch_id: &str) -> StoreResult<Vec<DataRecord>>;

    /// Mark all records of a batch anchored under `root`. Returns the count.
    async fn mark_anchored(&self, batch_id: &str, root: &str) -> StoreResult<usize>;

    /// Records of a batch ordered by `batch_index`.
    async fn records_in_batch(&self, batch_id: &str) -> StoreResult<Vec<DataRecord>>;

    /// Totals by status.
    async fn record_counts(&self) -> StoreResult<RecordCounts>;

    // -------------------------------------------------------------------------
    // Batches
    // -------------------------------------------------------------------------

    /// Persist a new batch; `Conflict` if the id is taken.
    async fn insert_batch(&self, batch: AnchorBatchRecord) -> StoreResult<()>;

    /// Look up a batch.
    async fn get_batch(&self, batch_id: &str) -> StoreResult<Option<AnchorBatchRecord>>;

    /// Apply chain receipts to a stored batch and return the updated batch.
    async fn record_chain_receipts(
        &self,
        batch_id: &str,
        receipts: Vec<ChainReceipt>,
    ) -> StoreResult<AnchorBatchRecord>;

    /// Atomically reserve the failed chains of a batch for one retry; see
    /// [`AnchorBatchRecord::reserve_failed`]. Returns the batch as stored
    /// after the reservation and the chains reserved for the caller.
    async fn claim_failed_chains(
        &self,
        batch_id: &str,
        lease: Duration,
    ) -> StoreResult<(AnchorBatchRecord, Vec<ChainId>)>;

    /// All batches, oldest first.
    async fn list_batches(&self) -> StoreResult<Vec<AnchorBatchRecord>>;

    // -------------------------------------------------------------------------
    // Auth logs
    // -------------------------------------------------------------------------

    /// Append an authentication log entry.
    async fn append_auth_log(&self, log: AuthLog) -> StoreResult<()>;

    /// Auth logs, optionally for one device, oldest first.
    async fn auth_logs(&self, device_id: Option<&str>) -> StoreResult<Vec<AuthLog>>;

    // -------------------------------------------------------------------------
    // Proposals
    // -------------------------------------------------------------------------

    /// Persist a new proposal.
    async fn insert_proposal(&self, proposal: Proposal) -> StoreResult<()>;

    /// Look up a proposal.
    async fn get_proposal(&self, proposal_id: &str) -> StoreResult<Option<Proposal>>;

    /// All proposals, oldest first.
    async fn list_proposals(&self) -> StoreResult<Vec<Proposal>>;

    /// Compare-and-set update: succeeds only if the stored revision equals
    /// `proposal.revision`; the stored copy gets the next revision.
    async fn update_proposal(&self, proposal: Proposal) -> StoreResult<Proposal>;

    // -------------------------------------------------------------------------
    // Signers
    // -------------------------------------------------------------------------

    /// Add an authorized signer; `Conflict` if the address is taken.
    async fn insert_signer(&self, signer: Signer) -> StoreResult<()>;

    /// All signers, oldest first.
    async fn list_signers(&self) -> StoreResult<Vec<Signer>>;
}
