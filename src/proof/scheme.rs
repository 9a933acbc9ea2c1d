//! Proof Schemes
//!
//! The orchestrator and the service talk to a [`ProofScheme`] rather than to
//! the commitment functions directly, so a sound scheme can replace the
//! structural one without touching callers.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::commitment::{self, CommitmentError, CommitmentPackage, COMMITMENT_PROTOCOL};

/// Cooperative cancellation point for proof generation.
///
/// Generation code calls [`Deadline::check`] between stages; the async caller
/// also bounds the whole attempt with a runtime timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline {
    expires_at: Option<Instant>,
}

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self { expires_at: Some(Instant::now() + timeout) }
    }

    /// A deadline that never expires.
    pub fn never() -> Self {
        Self { expires_at: None }
    }

    /// Has the deadline passed?
    pub fn expired(&self) -> bool {
        self.expires_at.map_or(false, |at| Instant::now() >= at)
    }

    /// Time left, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Fail with `DeadlineExceeded(stage)` once the deadline has passed.
    pub fn check(&self, stage: &'static str) -> Result<(), CommitmentError> {
        if self.expired() {
            Err(CommitmentError::DeadlineExceeded(stage))
        } else {
            Ok(())
        }
    }
}

/// Identifiers of known proof schemes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemeKind {
    /// Hash commitment with blinded components.
    Commitment,
    /// Groth16 SNARK (not implemented).
    Snark,
    /// Transparent STARK (not implemented).
    Stark,
}

impl SchemeKind {
    /// All known schemes.
    pub const ALL: [SchemeKind; 3] = [SchemeKind::Commitment, SchemeKind::Snark, SchemeKind::Stark];

    /// Wire name.
    pub fn name(self) -> &'static str {
        match self {
            SchemeKind::Commitment => COMMITMENT_PROTOCOL,
            SchemeKind::Snark => "snark",
            SchemeKind::Stark => "stark",
        }
    }

    /// Catalogue entry reported to clients.
    pub fn info(self) -> SchemeInfo {
        let (description, status) = match self {
            SchemeKind::Commitment => (
                "Hash commitment with blinded field components (structural verification)",
                SchemeStatus::Active,
            ),
            SchemeKind::Snark => ("Groth16 zk-SNARK", SchemeStatus::Planned),
            SchemeKind::Stark => ("Transparent zk-STARK", SchemeStatus::Planned),
        };
        SchemeInfo {
            scheme: self,
            name: self.name().to_string(),
            description: description.to_string(),
            status,
        }
    }

    /// The full catalogue.
    pub fn catalogue() -> Vec<SchemeInfo> {
        Self::ALL.iter().map(|k| k.info()).collect()
    }
}

impl fmt::Display for SchemeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Availability of a scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemeStatus {
    /// Usable.
    Active,
    /// Reserved identifier.
    Planned,
}

/// Scheme catalogue entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemeInfo {
    /// Identifier.
    pub scheme: SchemeKind,
    /// Display name.
    pub name: String,
    /// Short description.
    pub description: String,
    /// Availability.
    pub status: SchemeStatus,
}

/// A knowledge-proof scheme.
///
/// `generate` is CPU-bound and synchronous; callers on the async runtime
/// should run it on a blocking thread.
pub trait ProofScheme: Send + Sync {
    /// Scheme identifier.
    fn kind(&self) -> SchemeKind;

    /// Cheap input checks run before any generation attempt.
    fn validate(&self, _identity: &str, _secret: &str) -> Result<(), CommitmentError> {
        Ok(())
    }

    /// Produce a package proving knowledge of `secret` for `identity`.
    fn generate(
        &self,
        identity: &str,
        secret: &str,
        timestamp: u64,
        deadline: &Deadline,
    ) -> Result<CommitmentPackage, CommitmentError>;

    /// Check a package against an explicit clock reading.
    fn verify_at(
        &self,
        package: &CommitmentPackage,
        identity: &str,
        now: u64,
    ) -> Result<(), CommitmentError>;

    /// Check a package against the current clock.
    fn verify(&self, package: &CommitmentPackage, identity: &str) -> Result<(), CommitmentError> {
        self.verify_at(package, identity, crate::core::unix_now())
    }
}

/// The hash-commitment scheme.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommitmentScheme;

impl ProofScheme for CommitmentScheme {
    fn kind(&self) -> SchemeKind {
        SchemeKind::Commitment
    }

    fn validate(&self, identity: &str, secret: &str) -> Result<(), CommitmentError> {
        commitment::validate_inputs(identity, secret)
    }

    fn generate(
        &self,
        identity: &str,
        secret: &str,
        timestamp: u64,
        deadline: &Deadline,
    ) -> Result<CommitmentPackage, CommitmentError> {
        commitment::generate(identity, secret, timestamp, deadline)
    }

    fn verify_at(
        &self,
        package: &CommitmentPackage,
        identity: &str,
        now: u64,
    ) -> Result<(), CommitmentError> {
        if package.protocol != COMMITMENT_PROTOCOL {
            return Err(CommitmentError::Structural(format!(
                "unexpected protocol {}",
                package.protocol
            )));
        }
        commitment::verify_at(package, identity, now)
    }
}

/// Resolve a scheme by identifier.
pub fn scheme_for(kind: SchemeKind) -> Result<Arc<dyn ProofScheme>, CommitmentError> {
    match kind {
        SchemeKind::Commitment => Ok(Arc::new(CommitmentScheme)),
        other => Err(CommitmentError::UnsupportedScheme(other)),
    }
}

/// Resolve a scheme by wire name.
pub fn scheme_by_name(name: &str) -> Result<Arc<dyn ProofScheme>, CommitmentError> {
    let kind = SchemeKind::ALL
        .iter()
        .copied()
        .find(|k| k.name() == name)
        .ok_or_else(|| CommitmentError::Validation(format!("unknown proof scheme {}", name)))?;
    scheme_for(kind)
}
