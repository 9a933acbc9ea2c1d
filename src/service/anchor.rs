//! Batch Anchoring Workflow
//!
//! ```text
//! pending records ──claim──► MerkleBatch ──root──► chain A ─┐
//!                                             └──► chain B ─┼─► per-chain results
//!                                                           │
//!              ≥ 1 success: records anchored ◄──────────────┘
//!              all failed:  records stay claimed, retry_failed() finishes later
//! ```
//!
//! Verification reloads a batch in `batch_index` order, recomputes every
//! leaf from the stored payload and checks the inclusion proof against the
//! anchored root. Cross-chain verification additionally asks every chain
//! whether it still holds that root.
//!
//! Retries reserve the failed chains of a batch in the store before
//! submitting, so two retries of one batch never send the root twice.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::chain::{AnchorRequest, ChainClient, ChainId, ChainReceipt};
use crate::core::hash::{parse_hex, record_hash, to_hex, LeafHash};
use crate::proof::merkle::{verify_inclusion, InclusionProof, MerkleBatch, MerkleError};
use crate::store::{AnchorBatchRecord, ChainResult, DocumentStore, StoreError};

use super::events::{EventBus, ServerEvent};

/// Anchoring workflow errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnchorError {
    /// Nothing to anchor or bad arguments.
    #[error("{0}")]
    Validation(String),
    /// Unknown batch id.
    #[error("batch {0} not found")]
    BatchNotFound(String),
    /// Tree construction failed.
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A stored batch is unreadable.
    #[error("stored batch is corrupt: {0}")]
    Corrupt(String),
}

/// Result of checking one record against its batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    /// Is the record included under the anchored root?
    pub valid: bool,
    /// Batch checked.
    pub batch_id: String,
    /// Hex hash that was looked up.
    pub data_hash: String,
    /// Anchored root.
    pub root: String,
    /// Leaf position, when found.
    pub leaf_index: Option<usize>,
    /// Inclusion proof, when found.
    pub proof: Option<InclusionProof>,
    /// Why the check failed.
    pub reason: Option<String>,
}

/// Reason reported when no chain holds a batch root.
pub const NOT_ANCHORED: &str = "batch root not anchored on any chain";

/// How long a retry may hold a chain before another retry can take it over.
pub fn default_retry_lease() -> Duration {
    Duration::minutes(10)
}

/// Per-chain anchoring state of one batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchChainStatus {
    /// Batch.
    pub batch_id: String,
    /// Hex root.
    pub root: String,
    /// Leaves in the tree.
    pub record_count: usize,
    /// Chains the root was sent to.
    pub total_chains: usize,
    /// Chains holding the root.
    pub successful_chains: Vec<ChainId>,
    /// Chains whose latest attempt failed.
    pub failed_chains: Vec<ChainId>,
    /// Failed chains a retry is working on.
    pub retrying_chains: Vec<ChainId>,
    /// At least one chain holds the root.
    pub anchored: bool,
    /// Full per-chain results.
    pub results: Vec<ChainResult>,
}

/// Outcome of checking a root on one chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    /// Chain queried.
    pub chain: ChainId,
    /// Does the chain hold the root?
    pub verified: bool,
    /// Anchoring transaction.
    pub tx_hash: Option<String>,
    /// Inclusion block.
    pub block_number: Option<u64>,
    /// Why the chain could not confirm the root.
    pub error: Option<String>,
}

/// A record checked against its batch and every chain holding the root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossChainReport {
    /// Inclusion of the record under the stored root.
    pub inclusion: VerificationReport,
    /// Chains queried.
    pub total_chains: usize,
    /// Chains that confirmed the root.
    pub verified_chains: usize,
    /// Per-chain outcome.
    pub results: Vec<ChainVerification>,
    /// Record included and at least one chain confirmed the root.
    pub is_valid: bool,
}

/// Anchoring totals of one chain across all batches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSyncStatus {
    /// Chain.
    pub chain: ChainId,
    /// Batches whose root the chain holds.
    pub total_anchors: usize,
    /// Latest successful anchor.
    pub last_anchor_at: Option<DateTime<Utc>>,
    /// Gas spent on those anchors.
    pub gas_used: u64,
}

/// Claims, anchors, retries and verifies batches.
pub struct BatchAnchorWorkflow {
    store: Arc<dyn DocumentStore>,
    chain: Arc<dyn ChainClient>,
    events: EventBus,
    retry_lease: Duration,
}

impl BatchAnchorWorkflow {
    /// Create a workflow.
    pub fn new(store: Arc<dyn DocumentStore>, chain: Arc<dyn ChainClient>, events: EventBus) -> Self {
        Self { store, chain, events, retry_lease: default_retry_lease() }
    }

    /// Override the retry lease.
    pub fn with_retry_lease(mut self, lease: Duration) -> Self {
        self.retry_lease = lease;
        self
    }

    /// Claim all pending records and anchor their root on `chains`.
    #[instrument(skip(self, metadata))]
    pub async fn anchor(
        &self,
        chains: &[ChainId],
        metadata: Value,
    ) -> Result<AnchorBatchRecord, AnchorError> {
        if chains.is_empty() {
            return Err(AnchorError::Validation("no target chains".into()));
        }

        let batch_id = Uuid::new_v4().to_string();
        let claimed = self.store.claim_pending(&batch_id).await?;
        if claimed.is_empty() {
            return Err(AnchorError::Validation("no pending data".into()));
        }

        let tree = MerkleBatch::build(claimed.iter().map(|r| r.data_hash).collect());
        let root = to_hex(&tree.require_root()?);
        info!(%batch_id, records = claimed.len(), %root, "batch built");

        self.store
            .insert_batch(AnchorBatchRecord {
                batch_id: batch_id.clone(),
                root: root.clone(),
                record_count: claimed.len(),
                chain_results: Vec::new(),
                metadata: metadata.clone(),
                created_at: Utc::now(),
            })
            .await?;

        let receipts = self.submit(&root, claimed.len(), &metadata, chains).await;
        self.apply(&batch_id, receipts).await
    }

    /// Resubmit the stored root to every chain whose last attempt failed.
    /// Chains another retry is already resubmitting are left to it.
    #[instrument(skip(self))]
    pub async fn retry_failed(&self, batch_id: &str) -> Result<AnchorBatchRecord, AnchorError> {
        let (batch, failed) = self
            .store
            .claim_failed_chains(batch_id, self.retry_lease)
            .await
            .map_err(|e| match e {
                StoreError::NotFound { .. } => AnchorError::BatchNotFound(batch_id.to_string()),
                e => AnchorError::Store(e),
            })?;
        if failed.is_empty() {
            return Ok(batch);
        }

        info!(batch_id, chains = ?failed, "retrying failed chains");
        let receipts = self
            .submit(&batch.root, batch.record_count, &batch.metadata, &failed)
            .await;
        self.apply(batch_id, receipts).await
    }

    /// Check that `data_hash` is part of `batch_id` under its anchored root.
    #[instrument(skip(self, data_hash))]
    pub async fn verify(
        &self,
        data_hash: &LeafHash,
        batch_id: &str,
    ) -> Result<VerificationReport, AnchorError> {
        let batch = self.load(batch_id).await?;
        let anchored_root = parse_hex(&batch.root).map_err(|e| AnchorError::Corrupt(e.to_string()))?;

        let mut report = VerificationReport {
            valid: false,
            batch_id: batch_id.to_string(),
            data_hash: to_hex(data_hash),
            root: batch.root.clone(),
            leaf_index: None,
            proof: None,
            reason: None,
        };
        if !batch.any_success() {
            warn!(batch_id, "verification against an unanchored batch");
            report.reason = Some(NOT_ANCHORED.to_string());
            return Ok(report);
        }

        let records = self.store.records_in_batch(batch_id).await?;

        // Leaves are recomputed from stored content, not read back.
        let leaves: Vec<LeafHash> = records
            .iter()
            .map(|r| record_hash(&r.device_id, &r.payload, r.timestamp))
            .collect();
        let tree = MerkleBatch::build(leaves);

        let index = match tree.position_of(data_hash) {
            Some(index) => index,
            None => {
                let reason = if records.iter().any(|r| r.data_hash == *data_hash) {
                    "record content no longer matches its hash"
                } else {
                    "data hash not in batch"
                };
                warn!(batch_id, reason, "verification failed");
                report.reason = Some(reason.to_string());
                return Ok(report);
            }
        };

        let proof = tree.proof(index)?;
        report.valid = verify_inclusion(data_hash, &proof, &anchored_root);
        if !report.valid {
            warn!(batch_id, "rebuilt tree does not match anchored root");
            report.reason = Some("rebuilt tree does not match anchored root".into());
        }
        report.leaf_index = Some(index);
        report.proof = Some(proof);
        Ok(report)
    }

    /// Check a record's inclusion and ask each chain whether it holds the
    /// batch root. `chains` defaults to the chains that accepted the root.
    #[instrument(skip(self, data_hash, chains))]
    pub async fn verify_across_chains(
        &self,
        data_hash: &LeafHash,
        batch_id: &str,
        chains: Option<Vec<ChainId>>,
    ) -> Result<CrossChainReport, AnchorError> {
        let inclusion = self.verify(data_hash, batch_id).await?;
        let batch = self.load(batch_id).await?;
        let chains = chains.unwrap_or_else(|| batch.succeeded_chains());

        let checks = chains.iter().map(|chain| {
            let stored = batch.chain_results.iter().find(|r| &r.chain == chain);
            self.confirm_root(chain, &batch.root, stored)
        });
        let results = join_all(checks).await;

        let verified_chains = results.iter().filter(|r| r.verified).count();
        let is_valid = inclusion.valid && verified_chains > 0;
        info!(batch_id, verified_chains, total = results.len(), is_valid, "cross-chain verification");
        Ok(CrossChainReport {
            inclusion,
            total_chains: results.len(),
            verified_chains,
            results,
            is_valid,
        })
    }

    /// Per-chain state of a batch.
    pub async fn chain_status(&self, batch_id: &str) -> Result<BatchChainStatus, AnchorError> {
        let batch = self.load(batch_id).await?;
        Ok(BatchChainStatus {
            batch_id: batch.batch_id.clone(),
            root: batch.root.clone(),
            record_count: batch.record_count,
            total_chains: batch.chain_results.len(),
            successful_chains: batch.succeeded_chains(),
            failed_chains: batch.failed_chains(),
            retrying_chains: batch.retrying_chains(),
            anchored: batch.any_success(),
            results: batch.chain_results,
        })
    }

    /// Successful anchors per chain across every batch.
    pub async fn sync_status(&self) -> Result<Vec<ChainSyncStatus>, AnchorError> {
        let mut by_chain: BTreeMap<ChainId, ChainSyncStatus> = BTreeMap::new();
        for batch in self.store.list_batches().await? {
            for result in batch.chain_results.iter().filter(|r| r.success) {
                let entry = by_chain.entry(result.chain.clone()).or_insert_with(|| ChainSyncStatus {
                    chain: result.chain.clone(),
                    total_anchors: 0,
                    last_anchor_at: None,
                    gas_used: 0,
                });
                entry.total_anchors += 1;
                entry.gas_used += result.gas_used.unwrap_or(0);
                entry.last_anchor_at = entry.last_anchor_at.max(Some(result.updated_at));
            }
        }
        Ok(by_chain.into_values().collect())
    }

    /// All batches, oldest first.
    pub async fn list(&self) -> Result<Vec<AnchorBatchRecord>, AnchorError> {
        Ok(self.store.list_batches().await?)
    }

    /// Confirm `root` on `chain`, given the stored result for that chain.
    async fn confirm_root(
        &self,
        chain: &ChainId,
        root: &str,
        stored: Option<&ChainResult>,
    ) -> ChainVerification {
        let mut check = ChainVerification {
            chain: chain.clone(),
            verified: false,
            tx_hash: None,
            block_number: None,
            error: None,
        };
        match stored {
            None => check.error = Some("batch was not sent to this chain".into()),
            Some(result) if !result.success => check.error = Some("anchor failed".into()),
            Some(_) => match self.chain.find_anchor(chain, root).await {
                Ok(Some(location)) => {
                    check.verified = true;
                    check.tx_hash = Some(location.tx_hash);
                    check.block_number = Some(location.block_number);
                }
                Ok(None) => check.error = Some("root not found on chain".into()),
                Err(e) => {
                    warn!(%chain, error = %e, "chain lookup failed");
                    check.error = Some(e.to_string());
                }
            },
        }
        check
    }

    async fn load(&self, batch_id: &str) -> Result<AnchorBatchRecord, AnchorError> {
        self.store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| AnchorError::BatchNotFound(batch_id.to_string()))
    }

    /// Send the root to every chain concurrently; failures become receipts.
    async fn submit(
        &self,
        root: &str,
        batch_size: usize,
        metadata: &Value,
        chains: &[ChainId],
    ) -> Vec<ChainReceipt> {
        let submissions = chains.iter().map(|chain| async move {
            let request = AnchorRequest {
                chain: chain.clone(),
                root: root.to_string(),
                batch_size,
                metadata: metadata.clone(),
            };
            ChainReceipt::from_result(chain, self.chain.anchor(&request).await)
        });
        join_all(submissions).await
    }

    /// Persist receipts, mark records anchored on success, publish events.
    async fn apply(
        &self,
        batch_id: &str,
        receipts: Vec<ChainReceipt>,
    ) -> Result<AnchorBatchRecord, AnchorError> {
        let succeeded: Vec<ChainId> = receipts
            .iter()
            .filter(|r| r.success)
            .map(|r| r.chain.clone())
            .collect();
        for failed in receipts.iter().filter(|r| !r.success) {
            let error = failed.error.clone().unwrap_or_default();
            warn!(batch_id, chain = %failed.chain, %error, "anchor failed");
            self.events.publish(ServerEvent::ChainAnchorFailed {
                batch_id: batch_id.to_string(),
                chain: failed.chain.clone(),
                error,
            });
        }

        let batch = self.store.record_chain_receipts(batch_id, receipts).await?;

        if !succeeded.is_empty() {
            let marked = self.store.mark_anchored(batch_id, &batch.root).await?;
            info!(batch_id, marked, chains = ?succeeded, "batch anchored");
            self.events.publish(ServerEvent::BatchAnchored {
                batch_id: batch_id.to_string(),
                root: batch.root.clone(),
                record_count: batch.record_count,
                chains: succeeded,
            });
        }

        Ok(batch)
    }
}
