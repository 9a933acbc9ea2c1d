//! Commitment-Proof Authentication
//!
//! A claimant shows knowledge of a device secret without sending it:
//!
//! ```text
//! commitment = H(identity || "||" || secret || "||" || timestamp)
//! r1, r2     ← [1, MODULUS)
//!
//! a = [c·r1,     H(secret)·r2]
//! b = [[r1·r2,   c + r1],
//!      [r2·c,    r1 + r2]]
//! c = [c·r2,     H(identity)·r1]
//!
//! publicSignals = [H(identity), timestamp, c]
//! ```
//!
//! Verification is structural only: freshness, arity, identity binding and
//! range checks. The commitment is never recomputed, so a well-formed package
//! for the right identity passes regardless of the secret used.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::scheme::{Deadline, SchemeKind};
use crate::core::field::{hash_to_field, FieldElement};
use crate::core::unix_now;

/// Protocol tag carried by every package this module produces.
pub const COMMITMENT_PROTOCOL: &str = "commitment";

/// Accepted clock skew between package timestamp and verifier, in seconds.
pub const REPLAY_WINDOW_SECS: u64 = 300;

/// Minimum secret length in characters.
pub const MIN_SECRET_LEN: usize = 8;

/// Errors from generating or verifying a commitment package.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitmentError {
    /// Rejected input (empty identity, short secret).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Package timestamp outside the replay window.
    #[error("stale proof: timestamp {timestamp} is more than {window}s from {now}")]
    Replay {
        /// Package timestamp.
        timestamp: u64,
        /// Verifier clock.
        now: u64,
        /// Allowed skew.
        window: u64,
    },

    /// Proof components have the wrong shape or out-of-range values.
    #[error("malformed proof: {0}")]
    Structural(String),

    /// Public signals do not bind the claimed identity.
    #[error("proof does not match identity {0}")]
    IdentityMismatch(String),

    /// The generation deadline passed at a checkpoint.
    #[error("proof generation deadline exceeded at {0}")]
    DeadlineExceeded(&'static str),

    /// The requested scheme has no implementation.
    #[error("proof scheme {0} is not supported")]
    UnsupportedScheme(SchemeKind),
}

impl CommitmentError {
    /// Input errors are never worth retrying.
    pub fn is_validation(&self) -> bool {
        matches!(self, CommitmentError::Validation(_) | CommitmentError::UnsupportedScheme(_))
    }
}

/// Blinded proof components `a`, `b`, `c`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProofComponents {
    /// Two blinded values.
    pub a: Vec<FieldElement>,
    /// 2×2 matrix of blinding products.
    pub b: Vec<Vec<FieldElement>>,
    /// Two blinded values.
    pub c: Vec<FieldElement>,
}

/// A complete proof package as exchanged with clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitmentPackage {
    /// Scheme tag.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Blinded components.
    #[serde(default)]
    pub proof: ProofComponents,
    /// `[H(identity), timestamp, commitment]`.
    #[serde(default)]
    pub public_signals: Vec<FieldElement>,
    /// `0x`-prefixed commitment.
    #[serde(default)]
    pub commitment: String,
    /// Freshness anchor, unix seconds.
    #[serde(default)]
    pub timestamp: u64,
}

fn default_protocol() -> String {
    COMMITMENT_PROTOCOL.to_string()
}

impl Default for CommitmentPackage {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            proof: ProofComponents::default(),
            public_signals: Vec::new(),
            commitment: String::new(),
            timestamp: 0,
        }
    }
}

/// A device keypair in hex.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeypair {
    /// Returned once to the caller, never stored.
    pub private_key: String,
    /// `SHA-256(private_key)`.
    pub public_key_hash: String,
}

/// Reject empty identities and short secrets.
pub fn validate_inputs(identity: &str, secret: &str) -> Result<(), CommitmentError> {
    if identity.is_empty() {
        return Err(CommitmentError::Validation("identity must not be empty".into()));
    }
    if secret.is_empty() {
        return Err(CommitmentError::Validation("secret must not be empty".into()));
    }
    if secret.chars().count() < MIN_SECRET_LEN {
        return Err(CommitmentError::Validation(format!(
            "secret must be at least {} characters",
            MIN_SECRET_LEN
        )));
    }
    Ok(())
}

/// Compute the commitment field element.
pub fn compute_commitment(identity: &str, secret: &str, timestamp: u64) -> FieldElement {
    hash_to_field(format!("{}||{}||{}", identity, secret, timestamp).as_bytes())
}

/// Generate a fresh package, checking `deadline` between stages.
pub fn generate(
    identity: &str,
    secret: &str,
    timestamp: u64,
    deadline: &Deadline,
) -> Result<CommitmentPackage, CommitmentError> {
    validate_inputs(identity, secret)?;
    deadline.check("commitment")?;

    let commitment = compute_commitment(identity, secret, timestamp);
    let secret_hash = hash_to_field(secret.as_bytes());
    let identity_hash = hash_to_field(identity.as_bytes());
    deadline.check("blinding")?;

    let mut rng = rand::thread_rng();
    let r1 = FieldElement::random_nonzero(&mut rng);
    let r2 = FieldElement::random_nonzero(&mut rng);

    let proof = ProofComponents {
        a: vec![commitment * r1, secret_hash * r2],
        b: vec![vec![r1 * r2, commitment + r1], vec![r2 * commitment, r1 + r2]],
        c: vec![commitment * r2, identity_hash * r1],
    };
    deadline.check("assembly")?;

    Ok(CommitmentPackage {
        protocol: default_protocol(),
        proof,
        public_signals: vec![identity_hash, FieldElement::from_u64(timestamp), commitment],
        commitment: commitment.to_hex(),
        timestamp,
    })
}

/// Verify a package against the current clock.
pub fn verify(package: &CommitmentPackage, identity: &str) -> Result<(), CommitmentError> {
    verify_at(package, identity, unix_now())
}

/// Verify a package against an explicit clock reading.
pub fn verify_at(
    package: &CommitmentPackage,
    identity: &str,
    now: u64,
) -> Result<(), CommitmentError> {
    if now.abs_diff(package.timestamp) > REPLAY_WINDOW_SECS {
        return Err(CommitmentError::Replay {
            timestamp: package.timestamp,
            now,
            window: REPLAY_WINDOW_SECS,
        });
    }

    let proof = &package.proof;
    if proof.a.len() != 2 || proof.c.len() != 2 {
        return Err(CommitmentError::Structural(format!(
            "expected 2 components in a and c, got {} and {}",
            proof.a.len(),
            proof.c.len()
        )));
    }
    if proof.b.is_empty() {
        return Err(CommitmentError::Structural("missing b component".into()));
    }

    let expected = hash_to_field(identity.as_bytes());
    match package.public_signals.first() {
        Some(signal) if package.public_signals.len() >= 2 && *signal == expected => {}
        _ => return Err(CommitmentError::IdentityMismatch(identity.to_string())),
    }

    for value in proof.a.iter().chain(proof.c.iter()) {
        if value.is_zero() || !value.is_canonical() {
            return Err(CommitmentError::Structural(format!(
                "component {} outside (0, MODULUS)",
                value
            )));
        }
    }

    Ok(())
}

/// Derive a device keypair: `private = H(identity || random || now)`,
/// `public_key_hash = H(private)`.
pub fn derive_keypair(identity: &str) -> DeviceKeypair {
    let nonce = FieldElement::random_nonzero(&mut rand::thread_rng());
    let now = chrono::Utc::now().timestamp_micros();

    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update(nonce.to_string().as_bytes());
    hasher.update(now.to_string().as_bytes());
    let private_key = hex::encode(hasher.finalize());

    let public_key_hash = hex::encode(Sha256::digest(private_key.as_bytes()));
    DeviceKeypair { private_key, public_key_hash }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const NOW: u64 = 1_700_000_000;

    fn package() -> CommitmentPackage {
        generate("sensor-42", "correct horse", NOW, &Deadline::never()).unwrap()
    }

    #[test]
    fn test_generate_shape() {
        let pkg = package();
        assert_eq!(pkg.protocol, COMMITMENT_PROTOCOL);
        assert_eq!(pkg.proof.a.len(), 2);
        assert_eq!(pkg.proof.c.len(), 2);
        assert_eq!(pkg.proof.b.len(), 2);
        assert_eq!(pkg.public_signals.len(), 3);
        assert_eq!(pkg.public_signals[0], hash_to_field(b"sensor-42"));
        assert_eq!(pkg.public_signals[1], FieldElement::from_u64(NOW));

        let commitment = compute_commitment("sensor-42", "correct horse", NOW);
        assert_eq!(pkg.public_signals[2], commitment);
        assert_eq!(pkg.commitment, commitment.to_hex());
        assert!(pkg.commitment.starts_with("0x"));
    }

    #[test]
    fn test_blinding_is_fresh() {
        assert_ne!(package().proof, package().proof);
    }

    #[test]
    fn test_verify_accepts_fresh() {
        assert_eq!(verify_at(&package(), "sensor-42", NOW + 10), Ok(()));
        assert_eq!(verify_at(&package(), "sensor-42", NOW - REPLAY_WINDOW_SECS), Ok(()));
    }

    #[test]
    fn test_verify_rejects_replay() {
        let pkg = package();
        let err = verify_at(&pkg, "sensor-42", NOW + 301).unwrap_err();
        assert!(matches!(err, CommitmentError::Replay { .. }));

        // Stale at now - 301 from the verifier's point of view
        let old = generate("sensor-42", "correct horse", NOW - 301, &Deadline::never()).unwrap();
        assert!(matches!(
            verify_at(&old, "sensor-42", NOW),
            Err(CommitmentError::Replay { .. })
        ));
    }

    #[test]
    fn test_verify_rejects_wrong_identity() {
        assert_eq!(
            verify_at(&package(), "sensor-43", NOW),
            Err(CommitmentError::IdentityMismatch("sensor-43".into()))
        );
    }

    #[test]
    fn test_verify_checks_arity_before_identity() {
        let mut pkg = package();
        pkg.proof.a.pop();
        assert!(matches!(
            verify_at(&pkg, "someone-else", NOW),
            Err(CommitmentError::Structural(_))
        ));

        let mut pkg = package();
        pkg.proof.b.clear();
        assert!(matches!(verify_at(&pkg, "sensor-42", NOW), Err(CommitmentError::Structural(_))));
    }

    #[test]
    fn test_verify_range_checks() {
        let mut pkg = package();
        pkg.proof.c[1] = FieldElement::ZERO;
        assert!(matches!(verify_at(&pkg, "sensor-42", NOW), Err(CommitmentError::Structural(_))));

        let mut pkg = package();
        pkg.proof.a[0] = FieldElement::MODULUS;
        assert!(matches!(verify_at(&pkg, "sensor-42", NOW), Err(CommitmentError::Structural(_))));
    }

    #[test]
    fn test_short_public_signals_is_mismatch() {
        let mut pkg = package();
        pkg.public_signals.truncate(1);
        assert!(matches!(
            verify_at(&pkg, "sensor-42", NOW),
            Err(CommitmentError::IdentityMismatch(_))
        ));
    }

    #[test]
    fn test_generate_validation() {
        let never = Deadline::never();
        assert!(generate("", "long enough", NOW, &never).unwrap_err().is_validation());
        assert!(generate("dev", "", NOW, &never).unwrap_err().is_validation());
        assert!(generate("dev", "12345", NOW, &never).unwrap_err().is_validation());
        assert!(generate("dev", "12345678", NOW, &never).is_ok());
    }

    #[test]
    fn test_generate_honors_deadline() {
        let expired = Deadline::after(Duration::ZERO);
        assert_eq!(
            generate("dev", "12345678", NOW, &expired),
            Err(CommitmentError::DeadlineExceeded("commitment"))
        );
    }

    #[test]
    fn test_wire_shape() {
        let pkg = package();
        let json = serde_json::to_value(&pkg).unwrap();
        assert!(json["publicSignals"][1].is_string());
        assert_eq!(json["publicSignals"][1], NOW.to_string());
        assert!(json["proof"]["b"][0][0].is_string());
        assert_eq!(json["timestamp"], NOW);

        let back: CommitmentPackage = serde_json::from_value(json).unwrap();
        assert_eq!(back, pkg);
    }

    #[test]
    fn test_missing_components_decode_then_fail() {
        let json = serde_json::json!({
            "proof": { "a": ["1", "2"] },
            "publicSignals": [],
            "timestamp": NOW,
        });
        let pkg: CommitmentPackage = serde_json::from_value(json).unwrap();
        assert!(matches!(verify_at(&pkg, "x", NOW), Err(CommitmentError::Structural(_))));
    }

    #[test]
    fn test_derive_keypair() {
        let k1 = derive_keypair("dev");
        let k2 = derive_keypair("dev");
        assert_eq!(k1.private_key.len(), 64);
        assert_ne!(k1.private_key, k2.private_key);
        assert_eq!(
            k1.public_key_hash,
            hex::encode(Sha256::digest(k1.private_key.as_bytes()))
        );
    }
}
