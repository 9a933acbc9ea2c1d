//! Proof Generation Orchestrator
//!
//! Wraps a [`ProofScheme`] with caching, a per-attempt timeout and bounded
//! exponential-backoff retries.
//!
//! ```text
//! Idle ──► cache hit ───────────────────────────────► Success (cached)
//!   │
//!   └──► Attempting ──► Success
//!            │
//!            ├─ validation error ───────────────────► Failed (no retry)
//!            │
//!            └─ timeout / transient ─► BackoffWait ─► Attempting ...
//!                                                     └─► Exhausted(last cause)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::cache::{CacheKey, ProofCache, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};
use super::commitment::{CommitmentError, CommitmentPackage};
use super::scheme::{CommitmentScheme, Deadline, ProofScheme};

/// Default time allowed for one generation attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default backoff before the first retry; doubles for each later one.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Orchestrator tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Bound on a single attempt.
    pub attempt_timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff before retry `k` is `backoff_base * 2^k`.
    pub backoff_base: Duration,
    /// Cache capacity (0 disables caching).
    pub cache_capacity: usize,
    /// Cache entry lifetime.
    pub cache_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

impl OrchestratorConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            attempt_timeout: env_parse("IOT_PROOF_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.attempt_timeout),
            max_retries: env_parse("IOT_PROOF_MAX_RETRIES").unwrap_or(defaults.max_retries),
            backoff_base: env_parse("IOT_PROOF_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            cache_capacity: env_parse("IOT_PROOF_CACHE_CAPACITY")
                .unwrap_or(defaults.cache_capacity),
            cache_ttl: env_parse("IOT_PROOF_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
        }
    }

    /// Backoff before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        self.backoff_base.saturating_mul(1u32 << retry.min(16))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Why a single attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure {
    /// The attempt ran past its deadline.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    /// The scheme returned an error.
    #[error("{0}")]
    Failed(CommitmentError),
    /// The blocking task panicked or was cancelled.
    #[error("generation task aborted: {0}")]
    Aborted(String),
}

/// Orchestrator errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    /// Input rejected before any attempt.
    #[error(transparent)]
    Invalid(CommitmentError),
    /// Every attempt failed.
    #[error("proof generation failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Cause of the final failure.
        last: AttemptFailure,
    },
}

/// A package together with how it was obtained.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedProof {
    /// The package.
    pub package: CommitmentPackage,
    /// Served from cache.
    pub cached: bool,
    /// Generation attempts made for this call.
    pub attempts: u32,
    /// Wall time spent in this call.
    pub generation_time_ms: u64,
}

/// Counter snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    /// Generation attempts started.
    pub attempts: u64,
    /// Requests served from cache.
    pub cache_hits: u64,
    /// Attempts that hit the deadline.
    pub timeouts: u64,
}

/// Cache + timeout + retry around a proof scheme.
pub struct ProofOrchestrator {
    scheme: Arc<dyn ProofScheme>,
    cache: Arc<ProofCache>,
    config: OrchestratorConfig,
    attempts: AtomicU64,
    cache_hits: AtomicU64,
    timeouts: AtomicU64,
}

impl ProofOrchestrator {
    /// Create with an explicit scheme and cache.
    pub fn new(
        scheme: Arc<dyn ProofScheme>,
        cache: Arc<ProofCache>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            scheme,
            cache,
            config,
            attempts: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Commitment scheme with a cache sized from `config`.
    pub fn with_config(config: OrchestratorConfig) -> Self {
        let cache = Arc::new(ProofCache::new(config.cache_capacity, config.cache_ttl));
        Self::new(Arc::new(CommitmentScheme), cache, config)
    }

    /// The wrapped scheme.
    pub fn scheme(&self) -> &Arc<dyn ProofScheme> {
        &self.scheme
    }

    /// The injected cache.
    pub fn cache(&self) -> &Arc<ProofCache> {
        &self.cache
    }

    /// Active configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Counter snapshot.
    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Produce a package, from cache when possible.
    #[instrument(skip(self, secret))]
    pub async fn generate(
        &self,
        identity: &str,
        secret: &str,
        timestamp: u64,
    ) -> Result<GeneratedProof, OrchestratorError> {
        let started = Instant::now();
        self.scheme.validate(identity, secret).map_err(OrchestratorError::Invalid)?;

        let key = CacheKey::new(identity, secret, timestamp);
        if let Some(package) = self.cache.get(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!("proof cache hit");
            return Ok(GeneratedProof {
                package,
                cached: true,
                attempts: 0,
                generation_time_ms: elapsed_ms(started),
            });
        }

        let total = self.config.max_retries.saturating_add(1);
        let mut last = AttemptFailure::Aborted("no attempt made".into());

        for attempt in 0..total {
            if attempt > 0 {
                let delay = self.config.backoff(attempt - 1);
                debug!(attempt, ?delay, "backing off before retry");
                tokio::time::sleep(delay).await;
            }

            self.attempts.fetch_add(1, Ordering::Relaxed);
            match self.attempt(identity, secret, timestamp).await {
                Ok(package) => {
                    let package = self.cache.insert(key, package);
                    return Ok(GeneratedProof {
                        package,
                        cached: false,
                        attempts: attempt + 1,
                        generation_time_ms: elapsed_ms(started),
                    });
                }
                Err(AttemptFailure::Failed(e)) if e.is_validation() => {
                    return Err(OrchestratorError::Invalid(e));
                }
                Err(failure) => {
                    warn!(attempt = attempt + 1, total, error = %failure, "proof attempt failed");
                    last = failure;
                }
            }
        }

        Err(OrchestratorError::Exhausted { attempts: total, last })
    }

    /// One bounded attempt on the blocking pool.
    async fn attempt(
        &self,
        identity: &str,
        secret: &str,
        timestamp: u64,
    ) -> Result<CommitmentPackage, AttemptFailure> {
        let timeout = self.config.attempt_timeout;
        let deadline = Deadline::after(timeout);
        let scheme = Arc::clone(&self.scheme);
        let identity = identity.to_string();
        let secret = secret.to_string();

        let task = tokio::task::spawn_blocking(move || {
            scheme.generate(&identity, &secret, timestamp, &deadline)
        });

        match tokio::time::timeout(timeout, task).await {
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(AttemptFailure::TimedOut(timeout))
            }
            Ok(Err(join_err)) => Err(AttemptFailure::Aborted(join_err.to_string())),
            Ok(Ok(Err(CommitmentError::DeadlineExceeded(_)))) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(AttemptFailure::TimedOut(timeout))
            }
            Ok(Ok(Err(e))) => Err(AttemptFailure::Failed(e)),
            Ok(Ok(Ok(package))) => Ok(package),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::scheme::SchemeKind;
    use std::sync::atomic::AtomicU32;

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            attempt_timeout: Duration::from_secs(5),
            max_retries: 2,
            backoff_base: Duration::from_millis(1),
            ..Default::default()
        }
    }

    /// Sleeps past any short deadline.
    struct SlowScheme;

    impl ProofScheme for SlowScheme {
        fn kind(&self) -> SchemeKind {
            SchemeKind::Commitment
        }

        fn generate(
            &self,
            identity: &str,
            secret: &str,
            timestamp: u64,
            deadline: &Deadline,
        ) -> Result<CommitmentPackage, CommitmentError> {
            std::thread::sleep(Duration::from_millis(100));
            CommitmentScheme.generate(identity, secret, timestamp, deadline)
        }

        fn verify_at(&self, p: &CommitmentPackage, id: &str, now: u64) -> Result<(), CommitmentError> {
            CommitmentScheme.verify_at(p, id, now)
        }
    }

    /// Fails `failures` times with a structural error, then succeeds.
    struct FlakyScheme {
        failures: u32,
        calls: AtomicU32,
    }

    impl ProofScheme for FlakyScheme {
        fn kind(&self) -> SchemeKind {
            SchemeKind::Commitment
        }

        fn generate(
            &self,
            identity: &str,
            secret: &str,
            timestamp: u64,
            deadline: &Deadline,
        ) -> Result<CommitmentPackage, CommitmentError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(CommitmentError::Structural(format!("transient {}", call)));
            }
            CommitmentScheme.generate(identity, secret, timestamp, deadline)
        }

        fn verify_at(&self, p: &CommitmentPackage, id: &str, now: u64) -> Result<(), CommitmentError> {
            CommitmentScheme.verify_at(p, id, now)
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.backoff(0), Duration::from_secs(1));
        assert_eq!(config.backoff(1), Duration::from_secs(2));
        assert_eq!(config.backoff(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_cache_hit_is_identical_and_skips_generation() {
        let orch = ProofOrchestrator::with_config(fast_config());
        let first = orch.generate("dev-1", "secret-123", 1000).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.attempts, 1);

        let second = orch.generate("dev-1", "secret-123", 1000).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.attempts, 0);
        assert_eq!(second.package, first.package);
        assert_eq!(orch.stats(), OrchestratorStats { attempts: 1, cache_hits: 1, timeouts: 0 });
    }

    #[tokio::test]
    async fn test_validation_fails_fast() {
        let orch = ProofOrchestrator::with_config(fast_config());
        let err = orch.generate("dev-1", "12345", 1000).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Invalid(CommitmentError::Validation(_))));
        assert_eq!(orch.stats().attempts, 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let scheme = Arc::new(FlakyScheme { failures: 2, calls: AtomicU32::new(0) });
        let orch = ProofOrchestrator::new(scheme, Arc::new(ProofCache::default()), fast_config());
        let proof = orch.generate("dev-1", "secret-123", 1000).await.unwrap();
        assert_eq!(proof.attempts, 3);
        assert_eq!(orch.stats().attempts, 3);
    }

    #[tokio::test]
    async fn test_exhaustion_keeps_last_cause() {
        let scheme = Arc::new(FlakyScheme { failures: 10, calls: AtomicU32::new(0) });
        let orch = ProofOrchestrator::new(scheme, Arc::new(ProofCache::default()), fast_config());
        let err = orch.generate("dev-1", "secret-123", 1000).await.unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::Exhausted {
                attempts: 3,
                last: AttemptFailure::Failed(CommitmentError::Structural("transient 2".into())),
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_then_exhaustion() {
        let config = OrchestratorConfig {
            attempt_timeout: Duration::from_millis(10),
            max_retries: 1,
            backoff_base: Duration::from_millis(1),
            ..Default::default()
        };
        let orch = ProofOrchestrator::new(
            Arc::new(SlowScheme),
            Arc::new(ProofCache::default()),
            config,
        );
        let err = orch.generate("dev-1", "secret-123", 1000).await.unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::Exhausted {
                attempts: 2,
                last: AttemptFailure::TimedOut(Duration::from_millis(10)),
            }
        );
        assert_eq!(orch.stats().timeouts, 2);
        assert!(orch.cache().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_misses_converge() {
        let orch = Arc::new(ProofOrchestrator::with_config(fast_config()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let orch = Arc::clone(&orch);
                tokio::spawn(async move { orch.generate("dev-1", "secret-123", 1000).await })
            })
            .collect();

        let mut packages = Vec::new();
        for handle in handles {
            packages.push(handle.await.unwrap().unwrap().package);
        }
        let cached = orch.generate("dev-1", "secret-123", 1000).await.unwrap();
        assert!(packages.iter().all(|p| *p == cached.package));
    }
}
