//! In-memory document store.
//!
//! One async `RwLock` guards all collections, so every multi-step operation
//! (claim, anchor marking, compare-and-set) is a single critical section.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use super::models::{
    AnchorBatchRecord, AuthLog, DataRecord, Device, Proposal, RecordCounts, RecordStatus, Signer,
};
use super::{DocumentStore, StoreError, StoreResult};
use crate::chain::{ChainId, ChainReceipt};

#[derive(Debug, Default)]
struct MemoryState {
    devices: BTreeMap<String, Device>,
    /// Keyed by submission sequence.
    records: BTreeMap<u64, DataRecord>,
    next_record_seq: u64,
    batches: BTreeMap<String, AnchorBatchRecord>,
    batch_order: Vec<String>,
    auth_logs: Vec<AuthLog>,
    proposals: BTreeMap<String, Proposal>,
    proposal_order: Vec<String>,
    signers: Vec<Signer>,
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_device(&self, device: Device) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.devices.contains_key(&device.device_id) {
            return Err(StoreError::conflict("device", device.device_id));
        }
        state.devices.insert(device.device_id.clone(), device);
        Ok(())
    }

    async fn get_device(&self, device_id: &str) -> StoreResult<Option<Device>> {
        Ok(self.state.read().await.devices.get(device_id).cloned())
    }

    async fn list_devices(&self) -> StoreResult<Vec<Device>> {
        Ok(self.state.read().await.devices.values().cloned().collect())
    }

    async fn update_device(&self, device: Device) -> StoreResult<()> {
        let mut state = self.state.write().await;
        match state.devices.get_mut(&device.device_id) {
            Some(slot) => {
                *slot = device;
                Ok(())
            }
            None => Err(StoreError::not_found("device", device.device_id)),
        }
    }

    async fn touch_authenticated(&self, device_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let device = state
            .devices
            .get_mut(device_id)
            .ok_or_else(|| StoreError::not_found("device", device_id))?;
        device.last_authenticated = Some(at);
        Ok(())
    }

    async fn set_registration_tx(&self, device_id: &str, tx_hash: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let device = state
            .devices
            .get_mut(device_id)
            .ok_or_else(|| StoreError::not_found("device", device_id))?;
        device.registration_tx = Some(tx_hash.to_string());
        Ok(())
    }

    async fn increment_data_count(&self, device_id: &str) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let device = state
            .devices
            .get_mut(device_id)
            .ok_or_else(|| StoreError::not_found("device", device_id))?;
        device.total_data_submitted += 1;
        Ok(device.total_data_submitted)
    }

    async fn insert_record(&self, record: DataRecord) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let seq = state.next_record_seq;
        state.next_record_seq += 1;
        state.records.insert(seq, record);
        Ok(())
    }

    async fn pending_records(&self) -> StoreResult<Vec<DataRecord>> {
        let state = self.state.read().await;
        Ok(state.records.values().filter(|r| r.is_pending()).cloned().collect())
    }

    async fn claim_pending(&self, batch_id: &str) -> StoreResult<Vec<DataRecord>> {
        let mut state = self.state.write().await;
        let mut claimed = Vec::new();
        for record in state.records.values_mut().filter(|r| r.is_pending()) {
            record.status = RecordStatus::Claimed { batch_id: batch_id.to_string() };
            record.batch_id = Some(batch_id.to_string());
            record.batch_index = Some(claimed.len());
            claimed.push(record.clone());
        }
        Ok(claimed)
    }

    async fn mark_anchored(&self, batch_id: &str, root: &str) -> StoreResult<usize> {
        let mut state = self.state.write().await;
        let mut count = 0;
        for record in state
            .records
            .values_mut()
            .filter(|r| r.batch_id.as_deref() == Some(batch_id))
        {
            record.status = RecordStatus::Anchored;
            record.root = Some(root.to_string());
            count += 1;
        }
        Ok(count)
    }

    async fn records_in_batch(&self, batch_id: &str) -> StoreResult<Vec<DataRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<DataRecord> = state
            .records
            .values()
            .filter(|r| r.batch_id.as_deref() == Some(batch_id))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.batch_index);
        Ok(records)
    }

    async fn record_counts(&self) -> StoreResult<RecordCounts> {
        let state = self.state.read().await;
        let mut counts = RecordCounts { total: state.records.len(), ..Default::default() };
        for record in state.records.values() {
            match record.status {
                RecordStatus::Pending => counts.pending += 1,
                RecordStatus::Claimed { .. } => counts.claimed += 1,
                RecordStatus::Anchored => counts.anchored += 1,
            }
        }
        Ok(counts)
    }

    async fn insert_batch(&self, batch: AnchorBatchRecord) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.batches.contains_key(&batch.batch_id) {
            return Err(StoreError::conflict("batch", batch.batch_id));
        }
        state.batch_order.push(batch.batch_id.clone());
        state.batches.insert(batch.batch_id.clone(), batch);
        Ok(())
    }

    async fn get_batch(&self, batch_id: &str) -> StoreResult<Option<AnchorBatchRecord>> {
        Ok(self.state.read().await.batches.get(batch_id).cloned())
    }

    async fn record_chain_receipts(
        &self,
        batch_id: &str,
        receipts: Vec<ChainReceipt>,
    ) -> StoreResult<AnchorBatchRecord> {
        let mut state = self.state.write().await;
        let batch = state
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| StoreError::not_found("batch", batch_id))?;
        for receipt in receipts {
            batch.record_receipt(receipt);
        }
        Ok(batch.clone())
    }

    async fn claim_failed_chains(
        &self,
        batch_id: &str,
        lease: Duration,
    ) -> StoreResult<(AnchorBatchRecord, Vec<ChainId>)> {
        let mut state = self.state.write().await;
        let batch = state
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| StoreError::not_found("batch", batch_id))?;
        let reserved = batch.reserve_failed(Utc::now(), lease);
        Ok((batch.clone(), reserved))
    }

    async fn list_batches(&self) -> StoreResult<Vec<AnchorBatchRecord>> {
        let state = self.state.read().await;
        Ok(state
            .batch_order
            .iter()
            .filter_map(|id| state.batches.get(id).cloned())
            .collect())
    }

    async fn append_auth_log(&self, log: AuthLog) -> StoreResult<()> {
        self.state.write().await.auth_logs.push(log);
        Ok(())
    }

    async fn auth_logs(&self, device_id: Option<&str>) -> StoreResult<Vec<AuthLog>> {
        let state = self.state.read().await;
        Ok(state
            .auth_logs
            .iter()
            .filter(|log| device_id.map_or(true, |id| log.device_id == id))
            .cloned()
            .collect())
    }

    async fn insert_proposal(&self, proposal: Proposal) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.proposals.contains_key(&proposal.proposal_id) {
            return Err(StoreError::conflict("proposal", proposal.proposal_id));
        }
        state.proposal_order.push(proposal.proposal_id.clone());
        state.proposals.insert(proposal.proposal_id.clone(), proposal);
        Ok(())
    }

    async fn get_proposal(&self, proposal_id: &str) -> StoreResult<Option<Proposal>> {
        Ok(self.state.read().await.proposals.get(proposal_id).cloned())
    }

    async fn list_proposals(&self) -> StoreResult<Vec<Proposal>> {
        let state = self.state.read().await;
        Ok(state
            .proposal_order
            .iter()
            .filter_map(|id| state.proposals.get(id).cloned())
            .collect())
    }

    async fn update_proposal(&self, mut proposal: Proposal) -> StoreResult<Proposal> {
        let mut state = self.state.write().await;
        let stored = state
            .proposals
            .get_mut(&proposal.proposal_id)
            .ok_or_else(|| StoreError::not_found("proposal", proposal.proposal_id.clone()))?;
        if stored.revision != proposal.revision {
            return Err(StoreError::Stale { kind: "proposal", id: proposal.proposal_id });
        }
        proposal.revision += 1;
        *stored = proposal.clone();
        Ok(proposal)
    }

    async fn insert_signer(&self, signer: Signer) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.signers.iter().any(|s| s.address == signer.address) {
            return Err(StoreError::conflict("signer", signer.address));
        }
        state.signers.push(signer);
        Ok(())
    }

    async fn list_signers(&self) -> StoreResult<Vec<Signer>> {
        Ok(self.state.read().await.signers.clone())
    }
}
