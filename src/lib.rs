//! # IoT Anchor Server
//!
//! Device registry with commitment-proof authentication and multi-chain
//! Merkle batch anchoring.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    IOT ANCHOR SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/            - Pure primitives                         │
//! │  ├── hash.rs      - SHA-256 digests, canonical records      │
//! │  └── field.rs     - 256-bit prime field elements            │
//! │                                                             │
//! │  proof/           - Batch integrity and identity proofs     │
//! │  ├── merkle.rs    - Batch tree and inclusion proofs         │
//! │  ├── commitment.rs- Commitment package generate/verify      │
//! │  ├── scheme.rs    - Pluggable proof schemes                 │
//! │  ├── cache.rs     - Bounded proof cache                     │
//! │  └── orchestrator.rs - Timeout, retry and caching           │
//! │                                                             │
//! │  chain/           - Ledger clients, signing, nonces         │
//! │  store/           - Document store trait + memory store     │
//! │  service/         - Operations, anchoring, multisig, events │
//! │                                                             │
//! │  network/         - WebSocket transport                     │
//! │  ├── server.rs    - Accept loop, connections, fan-out       │
//! │  ├── protocol.rs  - Message types                           │
//! │  └── auth.rs      - Operator JWT validation                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! Records accumulate unanchored in the store. An anchor request claims
//! them atomically, builds a tree and writes the root to every target
//! chain. Any record can later be proven part of its batch by rebuilding
//! the tree and checking an inclusion proof against the anchored root.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod chain;
pub mod core;
pub mod network;
pub mod proof;
pub mod service;
pub mod store;

// Re-export commonly used types
pub use chain::{ChainClient, ChainId, ChainReceipt, LocalLedger, SigningKey};
pub use core::field::FieldElement;
pub use core::hash::{record_hash, LeafHash, NodeHash};
pub use proof::commitment::CommitmentPackage;
pub use proof::merkle::{verify_inclusion, InclusionProof, MerkleBatch};
pub use proof::orchestrator::ProofOrchestrator;
pub use service::{IotService, ServiceConfig, ServiceError};
pub use store::{DocumentStore, MemoryStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
