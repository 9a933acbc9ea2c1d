//! Bounded Proof Cache
//!
//! Generated packages keyed by `(identity, SHA-256(secret), timestamp)`.
//! Entries expire after a TTL; when full, the oldest insertion is evicted.
//! The map sits behind a plain mutex that is only held for map operations,
//! never across an await.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::core::hash::{hash_bytes, NodeHash};

use super::commitment::CommitmentPackage;

/// Default number of cached packages.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Default entry lifetime, matching the replay window.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Cache lookup key. The secret is only kept as a digest.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheKey {
    identity: String,
    secret_digest: NodeHash,
    timestamp: u64,
}

impl CacheKey {
    /// Build a key for one generation request.
    pub fn new(identity: &str, secret: &str, timestamp: u64) -> Self {
        Self {
            identity: identity.to_string(),
            secret_digest: hash_bytes(secret.as_bytes()),
            timestamp,
        }
    }

    /// Identity part of the key.
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

#[derive(Debug)]
struct CacheEntry {
    package: CommitmentPackage,
    inserted_at: Instant,
    seq: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: BTreeMap<CacheKey, CacheEntry>,
    // Insertion sequence -> key, oldest first.
    order: BTreeMap<u64, CacheKey>,
    next_seq: u64,
}

impl CacheState {
    fn remove(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.order.remove(&entry.seq);
        }
    }
}

/// TTL + capacity bounded package cache.
#[derive(Debug)]
pub struct ProofCache {
    state: Mutex<CacheState>,
    capacity: usize,
    ttl: Duration,
}

impl Default for ProofCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)
    }
}

impl ProofCache {
    /// Create a cache. A capacity of zero disables caching.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity,
            ttl,
        }
    }

    // A panic elsewhere cannot leave the maps half-updated, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_live(&self, entry: &CacheEntry) -> bool {
        entry.inserted_at.elapsed() < self.ttl
    }

    /// Look up a live entry, dropping it if expired.
    pub fn get(&self, key: &CacheKey) -> Option<CommitmentPackage> {
        let mut state = self.lock();
        let live = state.entries.get(key).map(|entry| self.is_live(entry))?;
        if live {
            state.entries.get(key).map(|entry| entry.package.clone())
        } else {
            state.remove(key);
            None
        }
    }

    /// Insert unless a live entry already exists; returns the stored package.
    ///
    /// Concurrent misses for the same key all observe the first writer's package.
    pub fn insert(&self, key: CacheKey, package: CommitmentPackage) -> CommitmentPackage {
        if self.capacity == 0 {
            return package;
        }

        let mut state = self.lock();
        if let Some(existing) = state.entries.get(&key) {
            if self.is_live(existing) {
                return existing.package.clone();
            }
            state.remove(&key);
        }

        while state.entries.len() >= self.capacity {
            let oldest = match state.order.iter().next() {
                Some((_, k)) => k.clone(),
                None => break,
            };
            state.remove(&oldest);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.insert(seq, key.clone());
        state.entries.insert(
            key,
            CacheEntry {
                package: package.clone(),
                inserted_at: Instant::now(),
                seq,
            },
        );
        package
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut state = self.lock();
        let expired: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| !self.is_live(entry))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        expired.len()
    }

    /// Number of stored entries (live or not yet purged).
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove everything.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
    }
}
