//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON object tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chain::{ChainId, GasEstimate, NetworkInfo};
use crate::proof::commitment::CommitmentPackage;
use crate::proof::scheme::SchemeInfo;
use crate::service::{
    Authentication, BatchChainStatus, ChainSyncStatus, CrossChainReport, DevicePresence,
    DeviceRegistration, GasOperation, Metrics, ProofCheck, ServerEvent, ServiceError, Submission,
    VerificationReport,
};
use crate::store::{AnchorBatchRecord, DataRecord, Device, Proposal, ProposalStatus, Signer};

pub use crate::service::ErrorCode;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate the connection as an operator.
    OperatorLogin {
        /// Operator JWT; required when operator auth is configured.
        #[serde(default)]
        token: Option<String>,
        /// Operator name used when auth is not configured.
        #[serde(default)]
        operator: Option<String>,
    },

    /// Register a new device.
    RegisterDevice {
        /// Device id.
        device_id: String,
        /// Device name.
        device_name: String,
        /// Device category.
        device_type: String,
        /// Device secret; never stored.
        secret: String,
    },

    /// Authenticate a device.
    AuthenticateDevice {
        /// Device id.
        device_id: String,
        /// Device secret.
        secret: String,
    },

    /// Verify a client-supplied proof package.
    VerifyProof {
        /// Identity to check against.
        device_id: String,
        /// The package.
        package: CommitmentPackage,
    },

    /// Submit a data record.
    SubmitData {
        /// Submitting device.
        device_id: String,
        /// Record payload.
        #[serde(alias = "data")]
        payload: Value,
        /// Device timestamp; server time when absent.
        #[serde(default)]
        timestamp: Option<u64>,
    },

    /// List registered devices.
    ListDevices,

    /// Fetch one device.
    GetDevice {
        /// Device id.
        device_id: String,
    },

    /// Device liveness report.
    Heartbeat {
        /// Device id.
        device_id: String,
    },

    /// Presence of one device.
    DeviceStatus {
        /// Device id.
        device_id: String,
    },

    /// Presence of every device.
    DeviceStatuses,

    /// Records waiting for a batch.
    PendingData,

    /// Anchor all pending records (operator).
    AnchorBatch {
        /// Metadata stored with the anchor.
        #[serde(default)]
        metadata: Value,
        /// Target chains; configured targets when absent.
        #[serde(default)]
        chains: Option<Vec<ChainId>>,
    },

    /// Resubmit a batch to its failed chains (operator).
    RetryBatch {
        /// Batch id.
        batch_id: String,
    },

    /// Check a record against a batch root.
    VerifyData {
        /// Hex data hash.
        data_hash: String,
        /// Batch id.
        batch_id: String,
    },

    /// Check a record against a batch root and the chains holding it.
    VerifyCrossChain {
        /// Hex data hash.
        data_hash: String,
        /// Batch id.
        batch_id: String,
        /// Chains to ask; the chains that accepted the root when absent.
        #[serde(default)]
        chains: Option<Vec<ChainId>>,
    },

    /// Per-chain state of a batch.
    AnchorStatus {
        /// Batch id.
        batch_id: String,
    },

    /// Anchoring totals per chain.
    ChainSyncStatus,

    /// List batches.
    ListBatches,

    /// Expected gas of a transaction.
    EstimateGas {
        /// Transaction to size.
        request: GasOperation,
        /// Target chain; the registration chain when absent.
        #[serde(default)]
        chain: Option<ChainId>,
    },

    /// Height, gas price and connectivity of a chain.
    NetworkInfo {
        /// Chain; the registration chain when absent.
        #[serde(default)]
        chain: Option<ChainId>,
    },

    /// System counters.
    Metrics,

    /// Proof scheme catalogue.
    ProofSchemes,

    /// Open a multisig registration proposal (operator).
    CreateProposal {
        /// Device id.
        device_id: String,
        /// Device name.
        device_name: String,
        /// Device category.
        device_type: String,
        /// Device public key hash.
        public_key_hash: String,
        /// Identity proof for the device.
        package: CommitmentPackage,
        /// Approvals needed.
        required_approvals: u32,
    },

    /// Approve a proposal (operator).
    ApproveProposal {
        /// Proposal id.
        proposal_id: String,
        /// Approver signature.
        signature: String,
    },

    /// Reject a proposal (operator).
    RejectProposal {
        /// Proposal id.
        proposal_id: String,
        /// Reason.
        reason: String,
    },

    /// Execute an approved proposal (operator).
    ExecuteProposal {
        /// Proposal id.
        proposal_id: String,
    },

    /// Authorize a proposal signer (operator).
    AddSigner {
        /// Signer address.
        address: String,
        /// Display name.
        name: String,
    },

    /// List authorized signers.
    ListSigners,

    /// Fetch one proposal.
    GetProposal {
        /// Proposal id.
        proposal_id: String,
    },

    /// List proposals.
    ListProposals {
        /// Status filter.
        #[serde(default)]
        status: Option<ProposalStatus>,
    },

    /// Start receiving server events.
    Subscribe,

    /// Stop receiving server events.
    Unsubscribe,

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp, echoed back.
        timestamp: u64,
    },
}

impl ClientMessage {
    /// Does this message require operator rights?
    pub fn is_operator_action(&self) -> bool {
        matches!(
            self,
            ClientMessage::AnchorBatch { .. }
                | ClientMessage::RetryBatch { .. }
                | ClientMessage::CreateProposal { .. }
                | ClientMessage::ApproveProposal { .. }
                | ClientMessage::RejectProposal { .. }
                | ClientMessage::ExecuteProposal { .. }
                | ClientMessage::AddSigner { .. }
        )
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Operator login outcome.
    OperatorAuth(OperatorAuthResult),
    /// Device registered.
    Registered(DeviceRegistration),
    /// Device authenticated.
    Authenticated(Authentication),
    /// Verdict on a supplied package.
    ProofChecked(ProofCheck),
    /// Data record stored.
    DataAccepted(Submission),
    /// Device list.
    Devices {
        /// Devices.
        devices: Vec<Device>,
        /// Count.
        total: usize,
    },
    /// One device.
    Device(Device),
    /// Presence of one device.
    Presence(DevicePresence),
    /// Presence of every device.
    DeviceStatuses {
        /// Devices.
        devices: Vec<DevicePresence>,
    },
    /// Pending records.
    PendingData {
        /// Records.
        records: Vec<DataRecord>,
        /// Count.
        count: usize,
    },
    /// A batch after anchoring or retry.
    Batch(AnchorBatchRecord),
    /// Batch list.
    Batches {
        /// Batches.
        batches: Vec<AnchorBatchRecord>,
    },
    /// Inclusion check result.
    Verification(VerificationReport),
    /// Inclusion plus per-chain confirmation.
    CrossChainVerification(CrossChainReport),
    /// Per-chain state of a batch.
    AnchorStatus(BatchChainStatus),
    /// Anchoring totals per chain.
    ChainSync {
        /// One entry per chain with an anchor.
        chains: Vec<ChainSyncStatus>,
    },
    /// Expected gas of a transaction.
    GasEstimate(GasEstimate),
    /// Chain state.
    NetworkInfo(NetworkInfo),
    /// System counters.
    Metrics(Metrics),
    /// Scheme catalogue.
    ProofSchemes {
        /// Schemes.
        schemes: Vec<SchemeInfo>,
    },
    /// One proposal.
    Proposal(Proposal),
    /// Proposal list.
    Proposals {
        /// Proposals.
        proposals: Vec<Proposal>,
    },
    /// Signer added.
    Signer(Signer),
    /// Signer list.
    Signers {
        /// Signers.
        signers: Vec<Signer>,
    },
    /// Event subscription state.
    Subscription {
        /// Receiving events?
        active: bool,
    },
    /// Pushed server event.
    Event(ServerEvent),
    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server time (unix millis).
        server_time: u64,
    },
    /// Error.
    Error(ServerError),
    /// Server is shutting down.
    Shutdown {
        /// Reason.
        reason: String,
    },
}

/// Operator login outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorAuthResult {
    /// Login succeeded.
    pub success: bool,
    /// Operator name.
    pub operator: Option<String>,
    /// Failure description.
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// Error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    /// Build an error payload.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl From<ServiceError> for ServerError {
    fn from(err: ServiceError) -> Self {
        Self { code: err.code(), message: err.to_string() }
    }
}

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_from_wire() {
        let msg = ClientMessage::from_json(
            r#"{"type":"submit_data","device_id":"dev-1","data":{"temp":20},"timestamp":5}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::SubmitData { device_id, payload, timestamp } => {
                assert_eq!(device_id, "dev-1");
                assert_eq!(payload, json!({"temp": 20}));
                assert_eq!(timestamp, Some(5));
            }
            other => panic!("wrong message {:?}", other),
        }

        let msg = ClientMessage::from_json(r#"{"type":"anchor_batch"}"#).unwrap();
        assert!(msg.is_operator_action());
        assert!(matches!(msg, ClientMessage::AnchorBatch { metadata: Value::Null, chains: None }));

        let msg = ClientMessage::from_json(r#"{"type":"list_proposals","status":"approved"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::ListProposals { status: Some(ProposalStatus::Approved) }));
        assert!(!msg.is_operator_action());
    }

    #[test]
    fn test_chain_messages_from_wire() {
        let msg = ClientMessage::from_json(
            r#"{"type":"estimate_gas","request":{"operation":"register_device","device_id":"d","device_type":"sensor","secret":"s3cret-value"},"chain":"amoy"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::EstimateGas { request: GasOperation::RegisterDevice { device_id, .. }, chain } => {
                assert_eq!(device_id, "d");
                assert_eq!(chain, Some(ChainId::new("amoy")));
            }
            other => panic!("wrong message {:?}", other),
        }

        let msg = ClientMessage::from_json(r#"{"type":"verify_cross_chain","data_hash":"ab","batch_id":"b1"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::VerifyCrossChain { chains: None, .. }));
        assert!(matches!(
            ClientMessage::from_json(r#"{"type":"network_info"}"#).unwrap(),
            ClientMessage::NetworkInfo { chain: None }
        ));
        assert!(matches!(
            ClientMessage::from_json(r#"{"type":"heartbeat","device_id":"d"}"#).unwrap(),
            ClientMessage::Heartbeat { .. }
        ));

        let add = ClientMessage::from_json(r#"{"type":"add_signer","address":"0xa1","name":"Alice"}"#).unwrap();
        assert!(add.is_operator_action());
        assert!(!ClientMessage::ListSigners.is_operator_action());
    }

    #[test]
    fn test_invalid_message_rejected() {
        assert!(ClientMessage::from_json(r#"{"type":"launch_rockets"}"#).is_err());
        assert!(ClientMessage::from_json(r#"{"type":"get_device"}"#).is_err());
        assert!(ClientMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_error_wire() {
        let msg = ServerMessage::Error(ServerError::new(ErrorCode::Replay, "stale"));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "error", "code": "replay", "message": "stale"}));

        let from_service = ServerError::from(ServiceError::NotFound("device x".into()));
        assert_eq!(from_service.code, ErrorCode::NotFound);
    }

    #[test]
    fn test_event_frame_roundtrip() {
        let msg = ServerMessage::Event(ServerEvent::DataSubmitted {
            device_id: "dev-1".into(),
            data_hash: "ab".repeat(32),
        });
        let json = msg.to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["event"], "data_submitted");

        match ServerMessage::from_json(&json).unwrap() {
            ServerMessage::Event(ServerEvent::DataSubmitted { device_id, .. }) => {
                assert_eq!(device_id, "dev-1")
            }
            other => panic!("wrong message {:?}", other),
        }
    }
}
