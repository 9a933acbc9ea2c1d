//! Ledger Clients
//!
//! Chains are independent: the same root is written to each target chain
//! separately and every chain answers with its own receipt.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CHAIN LAYER                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  mod.rs     - ChainClient trait, requests, receipts         │
//! │  ledger.rs  - In-process ledger simulation                  │
//! │  nonce.rs   - Per-account nonce sequencing                  │
//! │  signer.rs  - Signing credential sources                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod ledger;
pub mod nonce;
pub mod signer;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::field::FieldElement;
use crate::proof::commitment::ProofComponents;

pub use ledger::LocalLedger;
pub use nonce::{NonceGuard, NonceSequencer};
pub use signer::{EnvKeySource, SigningKey, SigningKeySource, StaticKeySource, SIGNING_KEY_ENV};

/// Gas limit attached to anchor transactions.
pub const ANCHOR_GAS_LIMIT: u64 = 200_000;

/// Gas limit attached to identity registrations.
pub const REGISTER_GAS_LIMIT: u64 = 500_000;

/// Name of a target chain (e.g. `sepolia`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    /// Wrap a chain name. Names are case-insensitive and stored lowercase.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_ascii_lowercase())
    }

    /// The chain name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a comma separated list, skipping blanks.
    pub fn parse_list(list: &str) -> Vec<ChainId> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ChainId::new)
            .collect()
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChainId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Chain client errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// The client has no connection for this chain.
    #[error("unknown chain: {0}")]
    UnknownChain(ChainId),
    /// The chain is not accepting transactions.
    #[error("chain {0} unavailable")]
    Unavailable(ChainId),
    /// No signing credential configured.
    #[error("signing key not configured ({0})")]
    MissingCredential(String),
    /// Signing credential is malformed.
    #[error("invalid signing key: {0}")]
    InvalidCredential(String),
    /// The transaction was rejected.
    #[error("transaction rejected on {chain}: {reason}")]
    Rejected {
        /// Target chain.
        chain: ChainId,
        /// Rejection reason.
        reason: String,
    },
}

/// Request to anchor a batch root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorRequest {
    /// Target chain.
    pub chain: ChainId,
    /// Hex batch root.
    pub root: String,
    /// Number of records in the batch.
    pub batch_size: usize,
    /// Free-form metadata stored with the anchor.
    pub metadata: Value,
}

/// Request to register a device identity on chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRegistration {
    /// Target chain.
    pub chain: ChainId,
    /// Device identifier.
    pub device_id: String,
    /// Hex hash of the device public key.
    pub public_key_hash: String,
    /// Device category.
    pub device_type: String,
    /// Proof components submitted with the registration.
    pub proof: ProofComponents,
    /// Public signals of the proof.
    pub public_signals: Vec<FieldElement>,
}

/// Outcome of one chain transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReceipt {
    /// Chain the transaction was sent to.
    pub chain: ChainId,
    /// Did the transaction succeed?
    pub success: bool,
    /// Transaction hash, when one was produced.
    pub tx_hash: Option<String>,
    /// Inclusion block.
    pub block_number: Option<u64>,
    /// Gas consumed.
    pub gas_used: Option<u64>,
    /// Failure description.
    pub error: Option<String>,
}

impl ChainReceipt {
    /// A failed receipt carrying `error`.
    pub fn failed(chain: ChainId, error: impl fmt::Display) -> Self {
        Self {
            chain,
            success: false,
            tx_hash: None,
            block_number: None,
            gas_used: None,
            error: Some(error.to_string()),
        }
    }

    /// Fold a client result into a receipt; errors become failed receipts.
    pub fn from_result(chain: &ChainId, result: Result<ChainReceipt, ChainError>) -> Self {
        result.unwrap_or_else(|e| Self::failed(chain.clone(), e))
    }
}

/// Where a root sits on a chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorLocation {
    /// Chain holding the root.
    pub chain: ChainId,
    /// Anchoring transaction.
    pub tx_hash: String,
    /// Inclusion block.
    pub block_number: u64,
}

/// Expected cost of a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimate {
    /// Target chain.
    pub chain: ChainId,
    /// Gas the transaction would consume.
    pub gas_estimate: u64,
    /// Limit attached to this kind of transaction.
    pub gas_limit: u64,
    /// Current gas price in wei.
    pub gas_price_wei: u64,
    /// `gas_estimate * gas_price_wei`.
    pub estimated_cost_wei: u128,
    /// Would the transaction fit under its limit?
    pub within_limit: bool,
}

/// Current state of one chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    /// Chain name.
    pub chain: ChainId,
    /// Latest block.
    pub block_number: u64,
    /// Current gas price in wei.
    pub gas_price_wei: u64,
    /// Is the chain accepting transactions?
    pub is_connected: bool,
    /// Test network?
    pub is_testnet: bool,
}

/// A client able to write to one or more chains.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Chains this client can reach.
    fn chains(&self) -> Vec<ChainId>;

    /// Anchor a batch root.
    async fn anchor(&self, request: &AnchorRequest) -> Result<ChainReceipt, ChainError>;

    /// Register a device identity.
    async fn register_identity(
        &self,
        registration: &IdentityRegistration,
    ) -> Result<ChainReceipt, ChainError>;

    /// Look up the anchor of `root` on `chain`. `None` if the chain does
    /// not hold it.
    async fn find_anchor(
        &self,
        chain: &ChainId,
        root: &str,
    ) -> Result<Option<AnchorLocation>, ChainError>;

    /// Gas an anchor transaction would need.
    async fn estimate_anchor(&self, request: &AnchorRequest) -> Result<GasEstimate, ChainError>;

    /// Gas an identity registration would need.
    async fn estimate_registration(
        &self,
        registration: &IdentityRegistration,
    ) -> Result<GasEstimate, ChainError>;

    /// Height, gas price and connectivity of `chain`.
    async fn network_info(&self, chain: &ChainId) -> Result<NetworkInfo, ChainError>;
}
