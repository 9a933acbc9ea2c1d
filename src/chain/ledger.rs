//! In-Process Ledger
//!
//! A deterministic stand-in for the external chains: every configured chain
//! keeps its own block height, anchored roots and registered identities.
//! Outages can be switched on per chain to exercise partial-failure paths.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::nonce::NonceSequencer;
use super::signer::{SigningKey, SigningKeySource};
use super::{
    AnchorLocation, AnchorRequest, ChainClient, ChainError, ChainId, ChainReceipt, GasEstimate,
    IdentityRegistration, NetworkInfo, ANCHOR_GAS_LIMIT, REGISTER_GAS_LIMIT,
};

/// Intrinsic gas of any transaction.
const BASE_GAS: u64 = 21_000;

/// Gas charged per payload byte.
const GAS_PER_BYTE: u64 = 16;

/// Gas charged for one storage write.
const STORAGE_GAS: u64 = 20_000;

/// Flat gas price of every simulated chain (1 gwei).
pub const GAS_PRICE_WEI: u64 = 1_000_000_000;

fn gas_for(payload: &[u8]) -> u64 {
    BASE_GAS + STORAGE_GAS + GAS_PER_BYTE * payload.len() as u64
}

/// A root written by [`LocalLedger::anchor`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnchoredRoot {
    /// Hex root.
    pub root: String,
    /// Records covered.
    pub batch_size: usize,
    /// Inclusion block.
    pub block_number: u64,
    /// Transaction hash.
    pub tx_hash: String,
}

#[derive(Debug, Default)]
struct ChainState {
    height: u64,
    outage: bool,
    latency: Option<Duration>,
    submissions: u64,
    anchors: Vec<AnchoredRoot>,
    identities: BTreeMap<String, String>,
}

/// Simulated multi-chain ledger.
#[derive(Debug)]
pub struct LocalLedger {
    signer: SigningKey,
    account: String,
    chains: Mutex<BTreeMap<ChainId, ChainState>>,
    nonces: NonceSequencer,
}

impl LocalLedger {
    /// Create a ledger serving `chains`, signing with `signer`.
    pub fn new(signer: SigningKey, chains: impl IntoIterator<Item = ChainId>) -> Self {
        let account = signer.account();
        Self {
            signer,
            account,
            chains: Mutex::new(chains.into_iter().map(|c| (c, ChainState::default())).collect()),
            nonces: NonceSequencer::new(),
        }
    }

    /// Create a ledger with a key loaded from `source`.
    pub fn from_source(
        source: &dyn SigningKeySource,
        chains: impl IntoIterator<Item = ChainId>,
    ) -> Result<Self, ChainError> {
        Ok(Self::new(source.signing_key()?, chains))
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ChainId, ChainState>> {
        self.chains.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signing account address.
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Take a chain down or bring it back.
    pub fn set_outage(&self, chain: &ChainId, down: bool) {
        if let Some(state) = self.lock().get_mut(chain) {
            state.outage = down;
        }
    }

    /// Delay every submission to `chain` by `latency`.
    pub fn set_latency(&self, chain: &ChainId, latency: Option<Duration>) {
        if let Some(state) = self.lock().get_mut(chain) {
            state.latency = latency;
        }
    }

    /// Transactions attempted on `chain`, including failed ones.
    pub fn submissions(&self, chain: &ChainId) -> u64 {
        self.lock().get(chain).map_or(0, |s| s.submissions)
    }

    /// Current block height.
    pub fn height(&self, chain: &ChainId) -> Option<u64> {
        self.lock().get(chain).map(|s| s.height)
    }

    /// Roots anchored on `chain`, oldest first.
    pub fn anchored_roots(&self, chain: &ChainId) -> Vec<AnchoredRoot> {
        self.lock().get(chain).map(|s| s.anchors.clone()).unwrap_or_default()
    }

    /// Public key hash registered for `device_id` on `chain`.
    pub fn registered_identity(&self, chain: &ChainId, device_id: &str) -> Option<String> {
        self.lock().get(chain)?.identities.get(device_id).cloned()
    }

    /// Reserve a nonce, apply `write` to the chain state and mint a receipt.
    async fn submit<F>(
        &self,
        chain: &ChainId,
        payload: &[u8],
        gas_limit: u64,
        write: F,
    ) -> Result<ChainReceipt, ChainError>
    where
        F: FnOnce(&mut ChainState, u64, &str),
    {
        let latency = self.lock().get(chain).and_then(|s| s.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let guard = self.nonces.reserve(chain, &self.account).await;
        let nonce = guard.nonce();

        let receipt = {
            let mut chains = self.lock();
            let state = chains
                .get_mut(chain)
                .ok_or_else(|| ChainError::UnknownChain(chain.clone()))?;
            state.submissions += 1;
            if state.outage {
                warn!(%chain, "submission while chain is down");
                return Err(ChainError::Unavailable(chain.clone()));
            }

            let gas_used = gas_for(payload);
            if gas_used > gas_limit {
                return Err(ChainError::Rejected {
                    chain: chain.clone(),
                    reason: format!("out of gas: needs {} of {}", gas_used, gas_limit),
                });
            }

            state.height += 1;
            let block = state.height;
            let tx_hash = self.tx_hash(chain, nonce, payload);
            write(state, block, &tx_hash);
            debug!(%chain, nonce, block, "transaction included");

            ChainReceipt {
                chain: chain.clone(),
                success: true,
                tx_hash: Some(tx_hash),
                block_number: Some(block),
                gas_used: Some(gas_used),
                error: None,
            }
        };

        guard.commit();
        Ok(receipt)
    }

    fn estimate(&self, chain: &ChainId, payload: &[u8], gas_limit: u64) -> Result<GasEstimate, ChainError> {
        let chains = self.lock();
        let state = chains.get(chain).ok_or_else(|| ChainError::UnknownChain(chain.clone()))?;
        if state.outage {
            return Err(ChainError::Unavailable(chain.clone()));
        }
        let gas_estimate = gas_for(payload);
        Ok(GasEstimate {
            chain: chain.clone(),
            gas_estimate,
            gas_limit,
            gas_price_wei: GAS_PRICE_WEI,
            estimated_cost_wei: u128::from(gas_estimate) * u128::from(GAS_PRICE_WEI),
            within_limit: gas_estimate <= gas_limit,
        })
    }

    fn tx_hash(&self, chain: &ChainId, nonce: u64, payload: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(chain.as_str().as_bytes());
        hasher.update(nonce.to_be_bytes());
        hasher.update(self.signer.sign(payload));
        format!("0x{}", hex::encode(hasher.finalize()))
    }
}

#[async_trait]
impl ChainClient for LocalLedger {
    fn chains(&self) -> Vec<ChainId> {
        self.lock().keys().cloned().collect()
    }

    async fn anchor(&self, request: &AnchorRequest) -> Result<ChainReceipt, ChainError> {
        let payload = serde_json::to_vec(request).map_err(|e| ChainError::Rejected {
            chain: request.chain.clone(),
            reason: e.to_string(),
        })?;
        let root = request.root.clone();
        let batch_size = request.batch_size;

        self.submit(&request.chain, &payload, ANCHOR_GAS_LIMIT, move |state, block, tx| {
            state.anchors.push(AnchoredRoot {
                root,
                batch_size,
                block_number: block,
                tx_hash: tx.to_string(),
            });
        })
        .await
    }

    async fn register_identity(
        &self,
        registration: &IdentityRegistration,
    ) -> Result<ChainReceipt, ChainError> {
        if self.registered_identity(&registration.chain, &registration.device_id).is_some() {
            return Err(ChainError::Rejected {
                chain: registration.chain.clone(),
                reason: format!("device {} already registered", registration.device_id),
            });
        }

        let payload = serde_json::to_vec(registration).map_err(|e| ChainError::Rejected {
            chain: registration.chain.clone(),
            reason: e.to_string(),
        })?;
        let device_id = registration.device_id.clone();
        let key_hash = registration.public_key_hash.clone();

        self.submit(&registration.chain, &payload, REGISTER_GAS_LIMIT, move |state, _, _| {
            state.identities.insert(device_id, key_hash);
        })
        .await
    }

    async fn find_anchor(
        &self,
        chain: &ChainId,
        root: &str,
    ) -> Result<Option<AnchorLocation>, ChainError> {
        let chains = self.lock();
        let state = chains.get(chain).ok_or_else(|| ChainError::UnknownChain(chain.clone()))?;
        if state.outage {
            return Err(ChainError::Unavailable(chain.clone()));
        }
        Ok(state.anchors.iter().find(|a| a.root == root).map(|a| AnchorLocation {
            chain: chain.clone(),
            tx_hash: a.tx_hash.clone(),
            block_number: a.block_number,
        }))
    }

    async fn estimate_anchor(&self, request: &AnchorRequest) -> Result<GasEstimate, ChainError> {
        let payload = serde_json::to_vec(request).map_err(|e| ChainError::Rejected {
            chain: request.chain.clone(),
            reason: e.to_string(),
        })?;
        self.estimate(&request.chain, &payload, ANCHOR_GAS_LIMIT)
    }

    async fn estimate_registration(
        &self,
        registration: &IdentityRegistration,
    ) -> Result<GasEstimate, ChainError> {
        let payload = serde_json::to_vec(registration).map_err(|e| ChainError::Rejected {
            chain: registration.chain.clone(),
            reason: e.to_string(),
        })?;
        self.estimate(&registration.chain, &payload, REGISTER_GAS_LIMIT)
    }

    async fn network_info(&self, chain: &ChainId) -> Result<NetworkInfo, ChainError> {
        let chains = self.lock();
        let state = chains.get(chain).ok_or_else(|| ChainError::UnknownChain(chain.clone()))?;
        Ok(NetworkInfo {
            chain: chain.clone(),
            block_number: state.height,
            gas_price_wei: GAS_PRICE_WEI,
            is_connected: !state.outage,
            is_testnet: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ledger() -> LocalLedger {
        LocalLedger::new(
            SigningKey::from_hex(&"07".repeat(32)).unwrap(),
            [ChainId::new("sepolia"), ChainId::new("amoy")],
        )
    }

    fn request(chain: &str) -> AnchorRequest {
        AnchorRequest {
            chain: ChainId::new(chain),
            root: "ab".repeat(32),
            batch_size: 3,
            metadata: json!({"source": "test"}),
        }
    }

    #[tokio::test]
    async fn test_anchor_advances_height() {
        let ledger = ledger();
        let sepolia = ChainId::new("sepolia");

        let r1 = ledger.anchor(&request("sepolia")).await.unwrap();
        let r2 = ledger.anchor(&request("sepolia")).await.unwrap();
        assert!(r1.success);
        assert_eq!(r1.block_number, Some(1));
        assert_eq!(r2.block_number, Some(2));
        assert_ne!(r1.tx_hash, r2.tx_hash);
        assert!(r1.gas_used.unwrap() > BASE_GAS);
        assert_eq!(ledger.anchored_roots(&sepolia).len(), 2);
        assert_eq!(ledger.height(&ChainId::new("amoy")), Some(0));
    }

    #[tokio::test]
    async fn test_tx_hash_is_deterministic() {
        let a = ledger().anchor(&request("amoy")).await.unwrap();
        let b = ledger().anchor(&request("amoy")).await.unwrap();
        assert_eq!(a.tx_hash, b.tx_hash);
    }

    #[tokio::test]
    async fn test_outage_and_recovery() {
        let ledger = ledger();
        let amoy = ChainId::new("amoy");
        ledger.set_outage(&amoy, true);

        assert_eq!(
            ledger.anchor(&request("amoy")).await,
            Err(ChainError::Unavailable(amoy.clone()))
        );
        assert_eq!(ledger.submissions(&amoy), 1);
        assert_eq!(ledger.height(&amoy), Some(0));

        ledger.set_outage(&amoy, false);
        let receipt = ledger.anchor(&request("amoy")).await.unwrap();
        // Failed submission did not consume a block or nonce
        assert_eq!(receipt.block_number, Some(1));
        assert_eq!(ledger.submissions(&amoy), 2);
    }

    #[tokio::test]
    async fn test_unknown_chain() {
        assert_eq!(
            ledger().anchor(&request("mainnet")).await,
            Err(ChainError::UnknownChain(ChainId::new("mainnet")))
        );
    }

    #[tokio::test]
    async fn test_register_identity_once() {
        let ledger = ledger();
        let reg = IdentityRegistration {
            chain: ChainId::new("sepolia"),
            device_id: "dev-1".into(),
            public_key_hash: "cd".repeat(32),
            device_type: "sensor".into(),
            proof: Default::default(),
            public_signals: Vec::new(),
        };
        assert!(ledger.register_identity(&reg).await.unwrap().success);
        assert_eq!(
            ledger.registered_identity(&reg.chain, "dev-1"),
            Some("cd".repeat(32))
        );
        assert!(matches!(
            ledger.register_identity(&reg).await,
            Err(ChainError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_find_anchor_and_estimates() {
        let ledger = ledger();
        let sepolia = ChainId::new("sepolia");
        let req = request("sepolia");

        let estimate = ledger.estimate_anchor(&req).await.unwrap();
        assert!(estimate.within_limit);
        assert_eq!(estimate.gas_limit, ANCHOR_GAS_LIMIT);
        assert_eq!(
            estimate.estimated_cost_wei,
            u128::from(estimate.gas_estimate) * u128::from(GAS_PRICE_WEI)
        );

        assert_eq!(ledger.find_anchor(&sepolia, &req.root).await.unwrap(), None);
        let receipt = ledger.anchor(&req).await.unwrap();
        // The estimate matches what the transaction then consumes
        assert_eq!(receipt.gas_used, Some(estimate.gas_estimate));

        let found = ledger.find_anchor(&sepolia, &req.root).await.unwrap().unwrap();
        assert_eq!(Some(found.tx_hash), receipt.tx_hash);
        assert_eq!(Some(found.block_number), receipt.block_number);
        assert_eq!(ledger.find_anchor(&ChainId::new("amoy"), &req.root).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_network_info_reports_outage() {
        let ledger = ledger();
        let amoy = ChainId::new("amoy");
        ledger.anchor(&request("amoy")).await.unwrap();

        let info = ledger.network_info(&amoy).await.unwrap();
        assert_eq!(info.block_number, 1);
        assert!(info.is_connected);

        ledger.set_outage(&amoy, true);
        assert!(!ledger.network_info(&amoy).await.unwrap().is_connected);
        assert_eq!(
            ledger.estimate_anchor(&request("amoy")).await,
            Err(ChainError::Unavailable(amoy.clone()))
        );
        assert!(matches!(
            ledger.network_info(&ChainId::new("mainnet")).await,
            Err(ChainError::UnknownChain(_))
        ));
    }
}
