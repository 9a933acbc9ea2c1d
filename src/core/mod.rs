//! Core hashing and field primitives.
//!
//! Everything here is pure apart from [`unix_now`]: no I/O, no shared state.
//! The batch tree and the commitment scheme are built on these two modules.

pub mod field;
pub mod hash;

// Re-export core types
pub use field::{hash_to_field, FieldElement, FieldParseError, MODULUS_GAP};
pub use hash::{
    canonical_record, hash_bytes, pair_hash, parse_hex, record_hash, sha256_hex, to_hex,
    DigestError, LeafHash, NodeHash,
};

/// Current wall-clock time as unix seconds.
///
/// A clock set before 1970 reads as zero.
pub fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}
