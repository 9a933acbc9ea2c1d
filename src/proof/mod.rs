//! Batch Integrity & Commitment-Proof Engine
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    PROOF ENGINE                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  merkle.rs       - Batch tree, inclusion proofs             │
//! │  commitment.rs   - Commitment package generate/verify       │
//! │  scheme.rs       - Pluggable scheme trait, deadlines        │
//! │  cache.rs        - TTL + capacity bounded package cache     │
//! │  orchestrator.rs - Cache, timeout and retry around a scheme │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod commitment;
pub mod merkle;
pub mod orchestrator;
pub mod scheme;

// Re-export key types
pub use cache::{CacheKey, ProofCache};
pub use commitment::{
    derive_keypair, CommitmentError, CommitmentPackage, DeviceKeypair, ProofComponents,
    REPLAY_WINDOW_SECS,
};
pub use merkle::{verify_inclusion, InclusionProof, MerkleBatch, MerkleError, Position, ProofStep, TreeInfo};
pub use orchestrator::{
    AttemptFailure, GeneratedProof, OrchestratorConfig, OrchestratorError, OrchestratorStats,
    ProofOrchestrator,
};
pub use scheme::{
    scheme_by_name, scheme_for, CommitmentScheme, Deadline, ProofScheme, SchemeInfo, SchemeKind,
    SchemeStatus,
};
