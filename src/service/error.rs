//! Service errors and their wire codes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::ChainError;
use crate::proof::commitment::CommitmentError;
use crate::proof::merkle::MerkleError;
use crate::proof::orchestrator::OrchestratorError;
use crate::store::StoreError;

use super::anchor::AnchorError;
use super::multisig::MultisigError;

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid input.
    ValidationError,
    /// Unknown entity.
    NotFound,
    /// Proof timestamp outside the replay window.
    Replay,
    /// Malformed proof.
    StructuralProof,
    /// Proof bound to another identity.
    IdentityMismatch,
    /// Proof generation timed out.
    GenerationTimeout,
    /// Proof generation failed after all retries.
    GenerationExhausted,
    /// Ledger could not be reached.
    ChainUnavailable,
    /// Proof scheme not implemented.
    UnsupportedScheme,
    /// Missing or invalid operator token.
    Unauthorized,
    /// Entity exists but the action is not allowed.
    Forbidden,
    /// Duplicate entity or concurrent modification.
    Conflict,
    /// Proposal expired.
    Expired,
    /// Message could not be parsed.
    InvalidMessage,
    /// Connection limit reached.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

/// Errors surfaced by the service layer.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Invalid input.
    #[error("{0}")]
    Validation(String),
    /// Unknown entity.
    #[error("{0}")]
    NotFound(String),
    /// Action not allowed for this entity.
    #[error("{0}")]
    Forbidden(String),
    /// Duplicate entity.
    #[error("{0}")]
    Conflict(String),
    /// Missing or invalid operator credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Proof verification or generation input failure.
    #[error(transparent)]
    Proof(#[from] CommitmentError),
    /// Proof generation failure.
    #[error(transparent)]
    Generation(#[from] OrchestratorError),
    /// Tree failure.
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    /// Ledger failure.
    #[error(transparent)]
    Chain(#[from] ChainError),
    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Anchoring workflow failure.
    #[error(transparent)]
    Anchor(#[from] AnchorError),
    /// Multisig failure.
    #[error(transparent)]
    Multisig(#[from] MultisigError),
}

/// Result alias for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    /// Wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::Validation(_) => ErrorCode::ValidationError,
            ServiceError::NotFound(_) => ErrorCode::NotFound,
            ServiceError::Forbidden(_) => ErrorCode::Forbidden,
            ServiceError::Conflict(_) => ErrorCode::Conflict,
            ServiceError::Unauthorized(_) => ErrorCode::Unauthorized,
            ServiceError::Proof(e) => commitment_code(e),
            ServiceError::Generation(OrchestratorError::Invalid(e)) => commitment_code(e),
            ServiceError::Generation(OrchestratorError::Exhausted { .. }) => {
                ErrorCode::GenerationExhausted
            }
            ServiceError::Merkle(e) if e.is_not_found() => ErrorCode::NotFound,
            ServiceError::Merkle(_) => ErrorCode::ValidationError,
            ServiceError::Chain(_) => ErrorCode::ChainUnavailable,
            ServiceError::Store(e) => store_code(e),
            ServiceError::Anchor(e) => match e {
                AnchorError::Validation(_) => ErrorCode::ValidationError,
                AnchorError::BatchNotFound(_) => ErrorCode::NotFound,
                AnchorError::Merkle(m) if m.is_not_found() => ErrorCode::NotFound,
                AnchorError::Merkle(_) => ErrorCode::ValidationError,
                AnchorError::Store(s) => store_code(s),
                AnchorError::Corrupt(_) => ErrorCode::InternalError,
            },
            ServiceError::Multisig(e) => match e {
                MultisigError::Validation(_) => ErrorCode::ValidationError,
                MultisigError::NotFound(_) => ErrorCode::NotFound,
                MultisigError::Expired(_) => ErrorCode::Expired,
                MultisigError::NotPending { .. } | MultisigError::NotApproved { .. } => {
                    ErrorCode::Forbidden
                }
                MultisigError::AlreadyVoted { .. }
                | MultisigError::ActiveProposal(_)
                | MultisigError::SignerExists(_) => ErrorCode::Conflict,
                MultisigError::UnauthorizedSigner(_) => ErrorCode::Forbidden,
                MultisigError::Store(s) => store_code(s),
            },
        }
    }
}

fn commitment_code(e: &CommitmentError) -> ErrorCode {
    match e {
        CommitmentError::Validation(_) => ErrorCode::ValidationError,
        CommitmentError::Replay { .. } => ErrorCode::Replay,
        CommitmentError::Structural(_) => ErrorCode::StructuralProof,
        CommitmentError::IdentityMismatch(_) => ErrorCode::IdentityMismatch,
        CommitmentError::DeadlineExceeded(_) => ErrorCode::GenerationTimeout,
        CommitmentError::UnsupportedScheme(_) => ErrorCode::UnsupportedScheme,
    }
}

fn store_code(e: &StoreError) -> ErrorCode {
    match e {
        StoreError::NotFound { .. } => ErrorCode::NotFound,
        StoreError::Conflict { .. } | StoreError::Stale { .. } => ErrorCode::Conflict,
        StoreError::Backend(_) => ErrorCode::InternalError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::orchestrator::AttemptFailure;
    use std::time::Duration;

    #[test]
    fn test_codes() {
        let replay = CommitmentError::Replay { timestamp: 0, now: 400, window: 300 };
        assert_eq!(ServiceError::from(replay).code(), ErrorCode::Replay);

        let invalid = OrchestratorError::Invalid(CommitmentError::Validation("short".into()));
        assert_eq!(ServiceError::from(invalid).code(), ErrorCode::ValidationError);

        let exhausted = OrchestratorError::Exhausted {
            attempts: 4,
            last: AttemptFailure::TimedOut(Duration::from_secs(30)),
        };
        assert_eq!(ServiceError::from(exhausted).code(), ErrorCode::GenerationExhausted);

        let missing = MerkleError::LeafNotFound { index: 3, leaf_count: 1 };
        assert_eq!(ServiceError::from(missing).code(), ErrorCode::NotFound);

        let stale = StoreError::Stale { kind: "proposal", id: "p".into() };
        assert_eq!(ServiceError::from(stale).code(), ErrorCode::Conflict);

        let outsider = MultisigError::UnauthorizedSigner("mallory".into());
        assert_eq!(ServiceError::from(outsider).code(), ErrorCode::Forbidden);
        let duplicate = MultisigError::SignerExists("0xabc".into());
        assert_eq!(ServiceError::from(duplicate).code(), ErrorCode::Conflict);
    }

    #[test]
    fn test_code_wire_names() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::GenerationExhausted).unwrap(),
            "\"generation_exhausted\""
        );
        assert_eq!(serde_json::to_string(&ErrorCode::ValidationError).unwrap(), "\"validation_error\"");
    }
}
