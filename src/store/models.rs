//! Persisted entities.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::chain::{ChainId, ChainReceipt};
use crate::core::hash::{hex_digest, LeafHash};
use crate::proof::commitment::CommitmentPackage;

/// A registered device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Unique identifier chosen by the device.
    pub device_id: String,
    /// Human readable name.
    pub device_name: String,
    /// Category (sensor, gateway, ...).
    pub device_type: String,
    /// Hex `SHA-256(private_key)`.
    pub public_key_hash: String,
    /// Registration time.
    pub registered_at: DateTime<Utc>,
    /// Last successful authentication.
    pub last_authenticated: Option<DateTime<Utc>>,
    /// Inactive devices cannot authenticate.
    pub is_active: bool,
    /// Registration transaction, when the chain accepted it.
    pub registration_tx: Option<String>,
    /// Records submitted so far.
    pub total_data_submitted: u64,
}

/// Lifecycle of a submitted record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum RecordStatus {
    /// Waiting for the next batch.
    Pending,
    /// Taken by a batch that has not reached any chain yet.
    Claimed {
        /// Claiming batch.
        batch_id: String,
    },
    /// Root written to at least one chain.
    Anchored,
}

/// One submitted data record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRecord {
    /// Record identifier.
    pub record_id: Uuid,
    /// Submitting device.
    pub device_id: String,
    /// Device payload.
    pub payload: Value,
    /// Device-side timestamp, unix seconds.
    pub timestamp: u64,
    /// Canonical leaf hash.
    #[serde(with = "hex_digest")]
    pub data_hash: LeafHash,
    /// Lifecycle state.
    pub status: RecordStatus,
    /// Batch that claimed the record.
    pub batch_id: Option<String>,
    /// Hex root of that batch, once anchored.
    pub root: Option<String>,
    /// Leaf position inside the batch.
    pub batch_index: Option<usize>,
    /// Server receive time.
    pub received_at: DateTime<Utc>,
}

impl DataRecord {
    /// A new pending record.
    pub fn pending(device_id: &str, payload: Value, timestamp: u64, data_hash: LeafHash) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            payload,
            timestamp,
            data_hash,
            status: RecordStatus::Pending,
            batch_id: None,
            root: None,
            batch_index: None,
            received_at: Utc::now(),
        }
    }

    /// Is the record waiting for a batch?
    pub fn is_pending(&self) -> bool {
        self.status == RecordStatus::Pending
    }
}

/// Record totals by status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounts {
    /// All records.
    pub total: usize,
    /// Waiting for a batch.
    pub pending: usize,
    /// Claimed but not anchored.
    pub claimed: usize,
    /// Anchored.
    pub anchored: usize,
}

/// Latest outcome on one chain for a batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainResult {
    /// Target chain.
    pub chain: ChainId,
    /// Did the anchor succeed?
    pub success: bool,
    /// Transaction hash.
    pub tx_hash: Option<String>,
    /// Inclusion block.
    pub block_number: Option<u64>,
    /// Gas consumed.
    pub gas_used: Option<u64>,
    /// Failure description.
    pub error: Option<String>,
    /// Submissions made to this chain for the batch.
    pub attempts: u32,
    /// Time of the latest submission.
    pub updated_at: DateTime<Utc>,
    /// Set while a retry owns this chain; cleared by the next receipt.
    #[serde(default)]
    pub retry_started: Option<DateTime<Utc>>,
}

impl ChainResult {
    /// First result for a chain.
    pub fn from_receipt(receipt: ChainReceipt) -> Self {
        Self {
            chain: receipt.chain,
            success: receipt.success,
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
            gas_used: receipt.gas_used,
            error: receipt.error,
            attempts: 1,
            updated_at: Utc::now(),
            retry_started: None,
        }
    }
}

/// A batch of records and its per-chain anchoring state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorBatchRecord {
    /// Batch identifier.
    pub batch_id: String,
    /// Hex Merkle root.
    pub root: String,
    /// Leaves in the tree.
    pub record_count: usize,
    /// Per-chain outcome, one entry per target chain.
    pub chain_results: Vec<ChainResult>,
    /// Caller supplied metadata.
    pub metadata: Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl AnchorBatchRecord {
    /// Has any chain accepted the root?
    pub fn any_success(&self) -> bool {
        self.chain_results.iter().any(|r| r.success)
    }

    /// Chains whose latest result failed.
    pub fn failed_chains(&self) -> Vec<ChainId> {
        self.chain_results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.chain.clone())
            .collect()
    }

    /// Chains a retry is resubmitting right now.
    pub fn retrying_chains(&self) -> Vec<ChainId> {
        self.chain_results
            .iter()
            .filter(|r| !r.success && r.retry_started.is_some())
            .map(|r| r.chain.clone())
            .collect()
    }

    /// Reserve every failed chain no other retry holds. A reservation older
    /// than `lease` is considered abandoned and can be taken over.
    pub fn reserve_failed(&mut self, now: DateTime<Utc>, lease: Duration) -> Vec<ChainId> {
        let mut reserved = Vec::new();
        for result in self.chain_results.iter_mut().filter(|r| !r.success) {
            let free = match result.retry_started {
                None => true,
                Some(started) => now - started >= lease,
            };
            if free {
                result.retry_started = Some(now);
                reserved.push(result.chain.clone());
            }
        }
        reserved
    }

    /// Chains that accepted the root.
    pub fn succeeded_chains(&self) -> Vec<ChainId> {
        self.chain_results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.chain.clone())
            .collect()
    }

    /// Gas spent across successful chains.
    pub fn gas_used(&self) -> u64 {
        self.chain_results
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| r.gas_used)
            .sum()
    }

    /// Replace or append the result for `receipt.chain`.
    pub fn record_receipt(&mut self, receipt: ChainReceipt) {
        match self.chain_results.iter_mut().find(|r| r.chain == receipt.chain) {
            Some(existing) => {
                let attempts = existing.attempts + 1;
                *existing = ChainResult { attempts, ..ChainResult::from_receipt(receipt) };
            }
            None => self.chain_results.push(ChainResult::from_receipt(receipt)),
        }
    }
}

/// One authentication attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthLog {
    /// Device that tried to authenticate.
    pub device_id: String,
    /// Attempt time.
    pub timestamp: DateTime<Utc>,
    /// Commitment of the generated package, if any.
    pub commitment: Option<String>,
    /// Outcome.
    pub success: bool,
    /// Failure reason.
    pub reason: Option<String>,
}

/// Default lifetime of a multisig proposal.
pub fn default_proposal_ttl() -> Duration {
    Duration::days(7)
}

/// Multisig proposal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    /// Collecting approvals.
    Pending,
    /// Threshold reached.
    Approved,
    /// Rejected by an approver.
    Rejected,
    /// Registration carried out.
    Executed,
    /// Expired before reaching the threshold.
    Expired,
}

/// An approval vote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    /// Approver identity.
    pub approver: String,
    /// Approver signature over the proposal.
    pub signature: String,
    /// Vote time.
    pub approved_at: DateTime<Utc>,
}

/// A rejection vote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    /// Rejector identity.
    pub rejector: String,
    /// Stated reason.
    pub reason: String,
    /// Vote time.
    pub rejected_at: DateTime<Utc>,
}

/// A party allowed to vote on proposals.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signer {
    /// Signer address; matches the voter name on approvals.
    pub address: String,
    /// Display name.
    pub name: String,
    /// Registration time.
    pub added_at: DateTime<Utc>,
    /// Inactive signers cannot vote.
    pub is_active: bool,
}

/// A device registration awaiting multiple approvals.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    /// Proposal identifier.
    pub proposal_id: String,
    /// Device to register.
    pub device_id: String,
    /// Device name.
    pub device_name: String,
    /// Device category.
    pub device_type: String,
    /// Device public key hash.
    pub public_key_hash: String,
    /// Proof package backing the registration.
    pub package: CommitmentPackage,
    /// Proposer identity.
    pub proposer: String,
    /// Approvals needed.
    pub required_approvals: u32,
    /// Approvals so far.
    pub approvals: Vec<Approval>,
    /// Rejections so far.
    pub rejections: Vec<Rejection>,
    /// Current state.
    pub status: ProposalStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
    /// Execution time.
    pub executed_at: Option<DateTime<Utc>>,
    /// Execution transaction.
    pub execution_tx: Option<String>,
    /// Store revision, bumped by every update.
    pub revision: u64,
}

impl Proposal {
    /// Has `who` already voted?
    pub fn has_voted(&self, who: &str) -> bool {
        self.approvals.iter().any(|a| a.approver == who)
            || self.rejections.iter().any(|r| r.rejector == who)
    }

    /// Is the proposal past its expiry at `now`?
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(chain: &str, success: bool) -> ChainReceipt {
        ChainReceipt {
            chain: ChainId::new(chain),
            success,
            tx_hash: success.then(|| "0x01".to_string()),
            block_number: success.then_some(1),
            gas_used: success.then_some(50_000),
            error: (!success).then(|| "down".to_string()),
        }
    }

    #[test]
    fn test_record_receipt_replaces_per_chain() {
        let mut batch = AnchorBatchRecord {
            batch_id: "b1".into(),
            root: "00".repeat(32),
            record_count: 1,
            chain_results: Vec::new(),
            metadata: Value::Null,
            created_at: Utc::now(),
        };
        batch.record_receipt(receipt("sepolia", true));
        batch.record_receipt(receipt("amoy", false));
        assert!(batch.any_success());
        assert_eq!(batch.failed_chains(), vec![ChainId::new("amoy")]);

        batch.record_receipt(receipt("amoy", true));
        assert_eq!(batch.chain_results.len(), 2);
        assert!(batch.failed_chains().is_empty());
        assert_eq!(batch.chain_results[1].attempts, 2);
        assert_eq!(batch.gas_used(), 100_000);
    }

    #[test]
    fn test_reserve_failed_is_exclusive_until_lease_ends() {
        let mut batch = AnchorBatchRecord {
            batch_id: "b1".into(),
            root: "00".repeat(32),
            record_count: 1,
            chain_results: Vec::new(),
            metadata: Value::Null,
            created_at: Utc::now(),
        };
        batch.record_receipt(receipt("sepolia", true));
        batch.record_receipt(receipt("amoy", false));

        let now = Utc::now();
        let lease = Duration::minutes(10);
        assert_eq!(batch.reserve_failed(now, lease), vec![ChainId::new("amoy")]);
        assert_eq!(batch.retrying_chains(), vec![ChainId::new("amoy")]);
        assert!(batch.reserve_failed(now, lease).is_empty());

        // Abandoned reservation
        let later = now + lease + Duration::seconds(1);
        assert_eq!(batch.reserve_failed(later, lease), vec![ChainId::new("amoy")]);

        batch.record_receipt(receipt("amoy", true));
        assert!(batch.retrying_chains().is_empty());
        assert!(batch.chain_results[1].retry_started.is_none());
    }

    #[test]
    fn test_record_status_wire() {
        let claimed = RecordStatus::Claimed { batch_id: "b1".into() };
        assert_eq!(
            serde_json::to_value(&claimed).unwrap(),
            serde_json::json!({"state": "claimed", "batch_id": "b1"})
        );
    }
}
