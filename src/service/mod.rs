//! IoT Anchor Service
//!
//! Every operation the transport exposes, over injected collaborators.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SERVICE LAYER                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  mod.rs       - IotService facade, config, responses        │
//! │  anchor.rs    - Claim, anchor, retry and verify batches     │
//! │  multisig.rs  - Registration proposals and signer registry  │
//! │  monitor.rs   - Device heartbeats and online/offline sweep  │
//! │  events.rs    - Broadcast of server events                  │
//! │  error.rs     - ServiceError and wire error codes           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod anchor;
pub mod error;
pub mod events;
pub mod monitor;
pub mod multisig;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::chain::{
    AnchorRequest, ChainClient, ChainId, ChainReceipt, GasEstimate, IdentityRegistration,
    NetworkInfo,
};
use crate::core::hash::{parse_hex, record_hash, to_hex};
use crate::core::unix_now;
use crate::proof::commitment::{derive_keypair, CommitmentPackage};
use crate::proof::orchestrator::{GeneratedProof, OrchestratorConfig, OrchestratorStats, ProofOrchestrator};
use crate::proof::scheme::{SchemeInfo, SchemeKind};
use crate::store::{
    AnchorBatchRecord, AuthLog, DataRecord, Device, DocumentStore, Proposal, ProposalStatus,
    Signer, StoreError,
};

pub use anchor::{
    AnchorError, BatchAnchorWorkflow, BatchChainStatus, ChainSyncStatus, ChainVerification,
    CrossChainReport, VerificationReport,
};
pub use error::{ErrorCode, ServiceError, ServiceResult};
pub use events::{EventBus, ServerEvent};
pub use monitor::{DeviceMonitor, DevicePresence, PresenceStatus};
pub use multisig::{MultisigError, MultisigManager, NewProposal};

/// Chain used when `IOT_TARGET_CHAINS` is unset.
pub const DEFAULT_CHAIN: &str = "sepolia";

// =============================================================================
// Configuration
// =============================================================================

/// Service configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Chain that receives identity registrations.
    pub default_chain: ChainId,
    /// Chains that receive batch roots.
    pub target_chains: Vec<ChainId>,
    /// Proof generation tuning.
    pub orchestrator: OrchestratorConfig,
    /// Heartbeat silence after which a device is reported offline.
    pub heartbeat_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_chain: ChainId::new(DEFAULT_CHAIN),
            target_chains: vec![ChainId::new(DEFAULT_CHAIN)],
            orchestrator: OrchestratorConfig::default(),
            heartbeat_timeout: monitor::default_heartbeat_timeout(),
        }
    }
}

impl ServiceConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let target_chains = std::env::var("IOT_TARGET_CHAINS")
            .map(|list| ChainId::parse_list(&list))
            .unwrap_or_default();
        let mut config = Self::with_chains(target_chains, OrchestratorConfig::from_env());
        if let Some(secs) = std::env::var("IOT_HEARTBEAT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
        {
            config.heartbeat_timeout = Duration::seconds(secs);
        }
        config
    }

    /// Config targeting `chains`; the first one takes registrations.
    pub fn with_chains(chains: Vec<ChainId>, orchestrator: OrchestratorConfig) -> Self {
        match chains.first() {
            Some(first) => Self {
                default_chain: first.clone(),
                target_chains: chains,
                orchestrator,
                ..Self::default()
            },
            None => Self { orchestrator, ..Self::default() },
        }
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Result of a device registration. The private key is never stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    /// Registered device.
    pub device_id: String,
    /// Hex hash of the device public key.
    pub public_key_hash: String,
    /// Device private key, returned once.
    pub private_key: String,
    /// Identity proof produced for the registration.
    pub proof: GeneratedProof,
    /// On-chain registration outcome.
    pub chain: ChainReceipt,
}

/// Result of a successful authentication.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authentication {
    /// Authenticated device.
    pub device_id: String,
    /// Authentication time.
    pub authenticated_at: DateTime<Utc>,
    /// Commitment of the verified package.
    pub commitment: String,
    /// Package came from cache.
    pub cached: bool,
}

/// Verdict on an externally supplied package.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofCheck {
    /// Did the package verify?
    pub valid: bool,
    /// Identity it was checked against.
    pub device_id: String,
    /// Error code on failure.
    pub code: Option<ErrorCode>,
    /// Failure description.
    pub reason: Option<String>,
}

/// Acknowledgement of a data submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    /// Stored record id.
    pub record_id: Uuid,
    /// Hex leaf hash.
    pub data_hash: String,
    /// Timestamp used for hashing.
    pub timestamp: u64,
}

/// Transaction whose cost is estimated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum GasOperation {
    /// Identity registration of a device; a proof is generated to size it.
    RegisterDevice {
        /// Device id.
        device_id: String,
        /// Device category.
        device_type: String,
        /// Device secret.
        secret: String,
    },
    /// Anchor of a batch root.
    MerkleAnchor {
        /// Hex root.
        root: String,
        /// Records in the batch.
        batch_size: usize,
        /// Metadata stored with the anchor.
        #[serde(default)]
        metadata: Value,
    },
}

/// Counts from one maintenance pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    /// Expired proof cache entries dropped.
    pub purged_proofs: usize,
    /// Proposals moved to Expired.
    pub expired_proposals: usize,
    /// Devices whose heartbeat timed out.
    pub offline_devices: Vec<String>,
}

/// Device counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    /// Registered devices.
    pub total: usize,
    /// Active devices.
    pub active: usize,
    /// Deactivated devices.
    pub inactive: usize,
    /// Devices with a recent heartbeat.
    #[serde(default)]
    pub online: usize,
}

/// Record counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMetrics {
    /// Submitted records.
    pub total_submitted: usize,
    /// Records under an anchored root.
    pub anchored: usize,
    /// Records waiting for a batch.
    pub pending: usize,
    /// Records in batches no chain has accepted yet.
    pub claimed: usize,
}

/// Gas spent on anchored batches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GasMetrics {
    /// Total gas over batches with at least one successful chain.
    pub total_gas_used: u64,
    /// Mean gas per such batch.
    pub average_gas_per_batch: f64,
}

/// System counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Devices.
    pub devices: DeviceMetrics,
    /// Records.
    pub data: DataMetrics,
    /// Batches created.
    pub batches: usize,
    /// Batches anchored on at least one chain.
    pub anchored_batches: usize,
    /// Authentication attempts logged.
    pub authentications: usize,
    /// Gas usage.
    pub gas: GasMetrics,
    /// Proof generation counters.
    pub proofs: OrchestratorStats,
}

// =============================================================================
// Service
// =============================================================================

/// The IoT anchor service.
pub struct IotService {
    config: ServiceConfig,
    store: Arc<dyn DocumentStore>,
    chain: Arc<dyn ChainClient>,
    orchestrator: ProofOrchestrator,
    anchors: BatchAnchorWorkflow,
    multisig: MultisigManager,
    monitor: DeviceMonitor,
    events: EventBus,
}

impl IotService {
    /// Wire a service over `store` and `chain`.
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn DocumentStore>,
        chain: Arc<dyn ChainClient>,
        events: EventBus,
    ) -> Self {
        let orchestrator = ProofOrchestrator::with_config(config.orchestrator.clone());
        Self::with_orchestrator(config, store, chain, events, orchestrator)
    }

    /// Wire a service with a prepared orchestrator.
    pub fn with_orchestrator(
        config: ServiceConfig,
        store: Arc<dyn DocumentStore>,
        chain: Arc<dyn ChainClient>,
        events: EventBus,
        orchestrator: ProofOrchestrator,
    ) -> Self {
        let anchors = BatchAnchorWorkflow::new(store.clone(), chain.clone(), events.clone());
        let multisig = MultisigManager::new(store.clone(), events.clone());
        let monitor = DeviceMonitor::new(config.heartbeat_timeout, events.clone());
        Self { config, store, chain, orchestrator, anchors, multisig, monitor, events }
    }

    /// Active configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Event bus shared with the transport.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Proof orchestrator.
    pub fn orchestrator(&self) -> &ProofOrchestrator {
        &self.orchestrator
    }

    // -------------------------------------------------------------------------
    // Devices
    // -------------------------------------------------------------------------

    /// Register a device: prove its identity, derive a keypair, persist it
    /// and then register it on the default chain.
    ///
    /// The store insert decides concurrent registrations of one id, so only
    /// the winner reaches the chain.
    #[instrument(skip(self, secret))]
    pub async fn register_device(
        &self,
        device_id: &str,
        device_name: &str,
        device_type: &str,
        secret: &str,
    ) -> ServiceResult<DeviceRegistration> {
        if device_name.trim().is_empty() {
            return Err(ServiceError::Validation("device name is required".into()));
        }
        if self.store.get_device(device_id).await?.is_some() {
            return Err(ServiceError::Conflict(format!("device {} already registered", device_id)));
        }

        let proof = self.orchestrator.generate(device_id, secret, unix_now()).await?;
        let keypair = derive_keypair(device_id);

        let device = Device {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            device_type: device_type.to_string(),
            public_key_hash: keypair.public_key_hash.clone(),
            registered_at: Utc::now(),
            last_authenticated: None,
            is_active: true,
            registration_tx: None,
            total_data_submitted: 0,
        };
        self.store.insert_device(device).await.map_err(|e| match e {
            StoreError::Conflict { .. } => {
                ServiceError::Conflict(format!("device {} already registered", device_id))
            }
            e => e.into(),
        })?;

        let chain = self.config.default_chain.clone();
        let registration = IdentityRegistration {
            chain: chain.clone(),
            device_id: device_id.to_string(),
            public_key_hash: keypair.public_key_hash.clone(),
            device_type: device_type.to_string(),
            proof: proof.package.proof.clone(),
            public_signals: proof.package.public_signals.clone(),
        };
        let receipt = ChainReceipt::from_result(&chain, self.chain.register_identity(&registration).await);
        match &receipt.tx_hash {
            Some(tx_hash) if receipt.success => {
                self.store.set_registration_tx(device_id, tx_hash).await?;
            }
            _ => warn!(%chain, error = ?receipt.error, "on-chain registration failed"),
        }

        info!(device_id, device_type, "device registered");
        self.events.publish(ServerEvent::DeviceRegistered {
            device_id: device_id.to_string(),
            device_type: device_type.to_string(),
            registration_tx: receipt.tx_hash.clone(),
        });

        Ok(DeviceRegistration {
            device_id: device_id.to_string(),
            public_key_hash: keypair.public_key_hash,
            private_key: keypair.private_key,
            proof,
            chain: receipt,
        })
    }

    /// Authenticate a device by generating and verifying a fresh proof.
    #[instrument(skip(self, secret))]
    pub async fn authenticate_device(
        &self,
        device_id: &str,
        secret: &str,
    ) -> ServiceResult<Authentication> {
        let device = self.device(device_id).await?;
        if !device.is_active {
            return Err(ServiceError::Forbidden(format!("device {} is deactivated", device_id)));
        }

        let outcome = match self.orchestrator.generate(device_id, secret, unix_now()).await {
            Ok(proof) => self
                .orchestrator
                .scheme()
                .verify(&proof.package, device_id)
                .map(|()| proof)
                .map_err(ServiceError::from),
            Err(e) => Err(e.into()),
        };

        let now = Utc::now();
        let proof = match outcome {
            Ok(proof) => proof,
            Err(e) => {
                warn!(device_id, error = %e, "authentication failed");
                self.store
                    .append_auth_log(AuthLog {
                        device_id: device_id.to_string(),
                        timestamp: now,
                        commitment: None,
                        success: false,
                        reason: Some(e.to_string()),
                    })
                    .await?;
                self.events.publish(ServerEvent::DeviceAuthenticated {
                    device_id: device_id.to_string(),
                    success: false,
                });
                return Err(e);
            }
        };

        self.store.touch_authenticated(device_id, now).await?;
        self.store
            .append_auth_log(AuthLog {
                device_id: device_id.to_string(),
                timestamp: now,
                commitment: Some(proof.package.commitment.clone()),
                success: true,
                reason: None,
            })
            .await?;

        info!(device_id, cached = proof.cached, "device authenticated");
        self.events.publish(ServerEvent::DeviceAuthenticated {
            device_id: device_id.to_string(),
            success: true,
        });

        Ok(Authentication {
            device_id: device_id.to_string(),
            authenticated_at: now,
            commitment: proof.package.commitment,
            cached: proof.cached,
        })
    }

    /// Verify a package supplied by a client.
    pub fn verify_proof(&self, device_id: &str, package: &CommitmentPackage) -> ServiceResult<ProofCheck> {
        if device_id.is_empty() {
            return Err(ServiceError::Validation("device id is required".into()));
        }

        let check = match self.orchestrator.scheme().verify(package, device_id) {
            Ok(()) => ProofCheck { valid: true, device_id: device_id.to_string(), code: None, reason: None },
            Err(e) => {
                warn!(device_id, error = %e, "proof rejected");
                let e = ServiceError::from(e);
                ProofCheck {
                    valid: false,
                    device_id: device_id.to_string(),
                    code: Some(e.code()),
                    reason: Some(e.to_string()),
                }
            }
        };
        Ok(check)
    }

    /// All devices.
    pub async fn list_devices(&self) -> ServiceResult<Vec<Device>> {
        Ok(self.store.list_devices().await?)
    }

    /// One device.
    pub async fn get_device(&self, device_id: &str) -> ServiceResult<Device> {
        self.device(device_id).await
    }

    async fn device(&self, device_id: &str) -> ServiceResult<Device> {
        self.store
            .get_device(device_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("device {} not registered", device_id)))
    }

    // -------------------------------------------------------------------------
    // Presence
    // -------------------------------------------------------------------------

    /// Record a heartbeat from a registered device.
    pub async fn heartbeat(&self, device_id: &str) -> ServiceResult<DevicePresence> {
        self.device(device_id).await?;
        Ok(self.monitor.heartbeat(device_id).await)
    }

    /// Presence of one registered device.
    pub async fn device_status(&self, device_id: &str) -> ServiceResult<DevicePresence> {
        self.device(device_id).await?;
        Ok(self.monitor.status(device_id).await)
    }

    /// Presence of every registered device.
    pub async fn device_statuses(&self) -> ServiceResult<Vec<DevicePresence>> {
        let mut statuses = Vec::new();
        for device in self.store.list_devices().await? {
            statuses.push(self.monitor.status(&device.device_id).await);
        }
        Ok(statuses)
    }

    // -------------------------------------------------------------------------
    // Data
    // -------------------------------------------------------------------------

    /// Store a record for the next batch.
    #[instrument(skip(self, payload))]
    pub async fn submit_data(
        &self,
        device_id: &str,
        payload: Value,
        timestamp: Option<u64>,
    ) -> ServiceResult<Submission> {
        self.device(device_id).await?;

        let timestamp = timestamp.unwrap_or_else(unix_now);
        let data_hash = record_hash(device_id, &payload, timestamp);
        let record = DataRecord::pending(device_id, payload, timestamp, data_hash);
        let record_id = record.record_id;

        self.store.insert_record(record).await?;
        let total = self.store.increment_data_count(device_id).await?;

        let data_hash = to_hex(&data_hash);
        debug!(device_id, %data_hash, total, "record stored");
        self.events.publish(ServerEvent::DataSubmitted {
            device_id: device_id.to_string(),
            data_hash: data_hash.clone(),
        });

        Ok(Submission { record_id, data_hash, timestamp })
    }

    /// Records waiting for a batch.
    pub async fn pending_data(&self) -> ServiceResult<Vec<DataRecord>> {
        Ok(self.store.pending_records().await?)
    }

    // -------------------------------------------------------------------------
    // Batches
    // -------------------------------------------------------------------------

    /// Anchor all pending records on `chains`, or the configured targets.
    pub async fn anchor_batch(
        &self,
        metadata: Value,
        chains: Option<Vec<ChainId>>,
    ) -> ServiceResult<AnchorBatchRecord> {
        let chains = match chains {
            Some(chains) if !chains.is_empty() => chains,
            _ => self.config.target_chains.clone(),
        };
        Ok(self.anchors.anchor(&chains, metadata).await?)
    }

    /// Resubmit a batch to its failed chains.
    pub async fn retry_batch(&self, batch_id: &str) -> ServiceResult<AnchorBatchRecord> {
        Ok(self.anchors.retry_failed(batch_id).await?)
    }

    /// Check that a hex data hash is part of a batch.
    pub async fn verify_data(&self, data_hash: &str, batch_id: &str) -> ServiceResult<VerificationReport> {
        let leaf = parse_hex(data_hash)
            .map_err(|e| ServiceError::Validation(format!("invalid data hash: {}", e)))?;
        Ok(self.anchors.verify(&leaf, batch_id).await?)
    }

    /// Check a hex data hash against its batch and the chains holding the
    /// batch root.
    pub async fn verify_cross_chain(
        &self,
        data_hash: &str,
        batch_id: &str,
        chains: Option<Vec<ChainId>>,
    ) -> ServiceResult<CrossChainReport> {
        let leaf = parse_hex(data_hash)
            .map_err(|e| ServiceError::Validation(format!("invalid data hash: {}", e)))?;
        let chains = chains.filter(|c| !c.is_empty());
        Ok(self.anchors.verify_across_chains(&leaf, batch_id, chains).await?)
    }

    /// Per-chain state of a batch.
    pub async fn anchor_status(&self, batch_id: &str) -> ServiceResult<BatchChainStatus> {
        Ok(self.anchors.chain_status(batch_id).await?)
    }

    /// Anchoring totals per chain.
    pub async fn chain_sync_status(&self) -> ServiceResult<Vec<ChainSyncStatus>> {
        Ok(self.anchors.sync_status().await?)
    }

    /// All batches.
    pub async fn list_batches(&self) -> ServiceResult<Vec<AnchorBatchRecord>> {
        Ok(self.anchors.list().await?)
    }

    // -------------------------------------------------------------------------
    // Chains
    // -------------------------------------------------------------------------

    /// Expected gas of `operation` on `chain`, or the default chain.
    #[instrument(skip(self, operation))]
    pub async fn estimate_gas(
        &self,
        operation: GasOperation,
        chain: Option<ChainId>,
    ) -> ServiceResult<GasEstimate> {
        let chain = chain.unwrap_or_else(|| self.config.default_chain.clone());
        let estimate = match operation {
            GasOperation::RegisterDevice { device_id, device_type, secret } => {
                if device_id.is_empty() || device_type.is_empty() {
                    return Err(ServiceError::Validation(
                        "device id and device type are required".into(),
                    ));
                }
                let proof = self.orchestrator.generate(&device_id, &secret, unix_now()).await?;
                let keypair = derive_keypair(&device_id);
                let registration = IdentityRegistration {
                    chain,
                    device_id,
                    public_key_hash: keypair.public_key_hash,
                    device_type,
                    proof: proof.package.proof,
                    public_signals: proof.package.public_signals,
                };
                self.chain.estimate_registration(&registration).await?
            }
            GasOperation::MerkleAnchor { root, batch_size, metadata } => {
                parse_hex(&root)
                    .map_err(|e| ServiceError::Validation(format!("invalid root: {}", e)))?;
                if batch_size == 0 {
                    return Err(ServiceError::Validation("batch size must be positive".into()));
                }
                let request = AnchorRequest { chain, root, batch_size, metadata };
                self.chain.estimate_anchor(&request).await?
            }
        };
        debug!(chain = %estimate.chain, gas = estimate.gas_estimate, "gas estimated");
        Ok(estimate)
    }

    /// Height, gas price and connectivity of `chain`, or the default chain.
    pub async fn network_info(&self, chain: Option<ChainId>) -> ServiceResult<NetworkInfo> {
        let chain = chain.unwrap_or_else(|| self.config.default_chain.clone());
        Ok(self.chain.network_info(&chain).await?)
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// System counters.
    pub async fn metrics(&self) -> ServiceResult<Metrics> {
        let devices = self.store.list_devices().await?;
        let active = devices.iter().filter(|d| d.is_active).count();
        let counts = self.store.record_counts().await?;
        let batches = self.store.list_batches().await?;
        let authentications = self.store.auth_logs(None).await?.len();

        let anchored: Vec<&AnchorBatchRecord> = batches.iter().filter(|b| b.any_success()).collect();
        let total_gas_used: u64 = anchored.iter().map(|b| b.gas_used()).sum();
        let average_gas_per_batch = if anchored.is_empty() {
            0.0
        } else {
            total_gas_used as f64 / anchored.len() as f64
        };

        Ok(Metrics {
            devices: DeviceMetrics {
                total: devices.len(),
                active,
                inactive: devices.len() - active,
                online: self.monitor.online_count().await,
            },
            data: DataMetrics {
                total_submitted: counts.total,
                anchored: counts.anchored,
                pending: counts.pending,
                claimed: counts.claimed,
            },
            batches: batches.len(),
            anchored_batches: anchored.len(),
            authentications,
            gas: GasMetrics { total_gas_used, average_gas_per_batch },
            proofs: self.orchestrator.stats(),
        })
    }

    /// Known proof schemes.
    pub fn proof_schemes(&self) -> Vec<SchemeInfo> {
        SchemeKind::catalogue()
    }

    // -------------------------------------------------------------------------
    // Multisig
    // -------------------------------------------------------------------------

    /// Open a registration proposal.
    pub async fn create_proposal(&self, request: NewProposal) -> ServiceResult<Proposal> {
        if self.store.get_device(&request.device_id).await?.is_some() {
            return Err(ServiceError::Conflict(format!(
                "device {} already registered",
                request.device_id
            )));
        }
        Ok(self.multisig.create(request).await?)
    }

    /// Approve a proposal.
    pub async fn approve_proposal(
        &self,
        proposal_id: &str,
        approver: &str,
        signature: &str,
    ) -> ServiceResult<Proposal> {
        Ok(self.multisig.approve(proposal_id, approver, signature).await?)
    }

    /// Reject a proposal.
    pub async fn reject_proposal(
        &self,
        proposal_id: &str,
        rejector: &str,
        reason: &str,
    ) -> ServiceResult<Proposal> {
        Ok(self.multisig.reject(proposal_id, rejector, reason).await?)
    }

    /// Carry out an approved proposal: register the identity on the default
    /// chain, persist the device and mark the proposal executed.
    #[instrument(skip(self))]
    pub async fn execute_proposal(&self, proposal_id: &str) -> ServiceResult<Proposal> {
        let proposal = self.multisig.get(proposal_id).await?;
        if proposal.status != ProposalStatus::Approved {
            return Err(MultisigError::NotApproved {
                id: proposal.proposal_id,
                status: proposal.status,
            }
            .into());
        }

        let registration = IdentityRegistration {
            chain: self.config.default_chain.clone(),
            device_id: proposal.device_id.clone(),
            public_key_hash: proposal.public_key_hash.clone(),
            device_type: proposal.device_type.clone(),
            proof: proposal.package.proof.clone(),
            public_signals: proposal.package.public_signals.clone(),
        };
        // Chain failure leaves the proposal approved for another attempt.
        let receipt = self.chain.register_identity(&registration).await?;

        self.store
            .insert_device(Device {
                device_id: proposal.device_id.clone(),
                device_name: proposal.device_name.clone(),
                device_type: proposal.device_type.clone(),
                public_key_hash: proposal.public_key_hash.clone(),
                registered_at: Utc::now(),
                last_authenticated: None,
                is_active: true,
                registration_tx: receipt.tx_hash.clone(),
                total_data_submitted: 0,
            })
            .await?;
        self.events.publish(ServerEvent::DeviceRegistered {
            device_id: proposal.device_id.clone(),
            device_type: proposal.device_type.clone(),
            registration_tx: receipt.tx_hash.clone(),
        });

        Ok(self.multisig.execute(proposal_id, receipt.tx_hash).await?)
    }

    /// Add an authorized signer.
    pub async fn add_signer(&self, address: &str, name: &str) -> ServiceResult<Signer> {
        Ok(self.multisig.add_signer(address, name).await?)
    }

    /// Authorized signers.
    pub async fn list_signers(&self) -> ServiceResult<Vec<Signer>> {
        Ok(self.multisig.list_signers().await?)
    }

    /// One proposal.
    pub async fn get_proposal(&self, proposal_id: &str) -> ServiceResult<Proposal> {
        Ok(self.multisig.get(proposal_id).await?)
    }

    /// Proposals, optionally by status.
    pub async fn list_proposals(&self, status: Option<ProposalStatus>) -> ServiceResult<Vec<Proposal>> {
        Ok(self.multisig.list(status).await?)
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Drop expired cache entries, expire overdue proposals and mark
    /// silent devices offline.
    pub async fn maintenance(&self) -> ServiceResult<MaintenanceReport> {
        let purged_proofs = self.orchestrator.cache().purge_expired();
        let expired_proposals = self.multisig.expire_stale().await?;
        let offline_devices = self.monitor.check_timeouts().await;
        if purged_proofs > 0 {
            debug!(purged_proofs, "expired proofs purged");
        }
        Ok(MaintenanceReport { purged_proofs, expired_proposals, offline_devices })
    }
}
