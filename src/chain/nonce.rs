//! Nonce Sequencing
//!
//! All ledger writes share one signing account per chain, so nonce
//! assignment and submission must be serialized. A [`NonceGuard`] holds the
//! account's async lock for the whole submission; the nonce only advances
//! when the guard is committed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::ChainId;

/// Per `(chain, account)` nonce counters.
#[derive(Debug, Default)]
pub struct NonceSequencer {
    accounts: Mutex<BTreeMap<(ChainId, String), Arc<AsyncMutex<u64>>>>,
}

impl NonceSequencer {
    /// Create an empty sequencer.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, chain: &ChainId, account: &str) -> Arc<AsyncMutex<u64>> {
        let mut accounts = self.accounts.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            accounts
                .entry((chain.clone(), account.to_string()))
                .or_insert_with(|| Arc::new(AsyncMutex::new(0))),
        )
    }

    /// Wait for exclusive use of the account and return its next nonce.
    pub async fn reserve(&self, chain: &ChainId, account: &str) -> NonceGuard {
        let slot = self.slot(chain, account);
        NonceGuard { guard: slot.lock_owned().await }
    }

    /// Next nonce without reserving it.
    pub async fn peek(&self, chain: &ChainId, account: &str) -> u64 {
        *self.slot(chain, account).lock().await
    }
}

/// Exclusive hold on one account's nonce.
#[derive(Debug)]
pub struct NonceGuard {
    guard: OwnedMutexGuard<u64>,
}

impl NonceGuard {
    /// Nonce to use for the held submission.
    pub fn nonce(&self) -> u64 {
        *self.guard
    }

    /// Mark the nonce consumed and release the account.
    pub fn commit(mut self) {
        *self.guard += 1;
    }
}
