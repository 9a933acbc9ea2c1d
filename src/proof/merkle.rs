//! Batch Merkle Trees
//!
//! Binary SHA-256 tree over the leaf hashes of one anchoring batch.
//! The root is what goes on chain; inclusion proofs let anyone re-check that
//! a single record belongs to the batch and was not altered.
//!
//! ## Layout
//!
//! ```text
//!            root                 levels[2]
//!          /      \
//!     H(A,B)      H(C,C)          levels[1]
//!     /    \      /    \
//!    A      B    C    (C)         levels[0] = leaves
//! ```
//!
//! An odd tail is paired with itself at every level where it occurs; there is
//! no padding to a power of two and no domain separation, so roots match any
//! other implementation of the same rule.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::hash::{hex_digest, pair_hash, parse_hex, to_hex, LeafHash, NodeHash};

/// Errors from tree construction and proof lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MerkleError {
    /// The batch has no leaves, so there is no root to prove against.
    #[error("batch tree is empty")]
    EmptyBatch,
    /// Requested leaf index is outside the batch.
    #[error("leaf index {index} not found in batch of {leaf_count}")]
    LeafNotFound {
        /// Requested index.
        index: usize,
        /// Number of leaves in the tree.
        leaf_count: usize,
    },
    /// A leaf supplied as text is not a 32-byte hex digest.
    #[error("invalid leaf at position {position}: {reason}")]
    InvalidLeaf {
        /// Position of the bad leaf in the input.
        position: usize,
        /// Decoder message.
        reason: String,
    },
}

impl MerkleError {
    /// True for lookups that should surface as "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(self, MerkleError::EmptyBatch | MerkleError::LeafNotFound { .. })
    }
}

/// Which side of the running hash a sibling sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    /// Sibling is hashed first: `H(sibling || current)`.
    Left,
    /// Sibling is hashed second: `H(current || sibling)`.
    Right,
}

/// One level of an inclusion proof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    /// Sibling node hash.
    #[serde(with = "hex_digest")]
    pub hash: NodeHash,
    /// Sibling side.
    pub position: Position,
}

/// Path from a leaf to the root, leaf level first.
///
/// Serializes as a bare JSON array of `{hash, position}` objects.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InclusionProof {
    /// Steps from the leaf level upward.
    pub steps: Vec<ProofStep>,
}

impl InclusionProof {
    /// Number of steps (tree height minus one).
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True for the proof of a single-leaf tree.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Shape summary of a built tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeInfo {
    /// Number of leaves.
    pub leaf_count: usize,
    /// Number of levels including leaves and root.
    pub tree_height: usize,
    /// Hex root, absent for an empty tree.
    pub root: Option<String>,
    /// Node count per level, leaves first.
    pub levels: Vec<usize>,
}

/// Immutable Merkle tree over a batch of leaf hashes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MerkleBatch {
    /// All tree levels (leaves at index 0, root at last index)
    levels: Vec<Vec<NodeHash>>,
}

impl MerkleBatch {
    /// Build the tree over ordered leaves.
    pub fn build(leaves: Vec<LeafHash>) -> Self {
        if leaves.is_empty() {
            return Self::default();
        }

        let mut levels = vec![leaves];
        while let Some(current) = levels.last() {
            if current.len() <= 1 {
                break;
            }
            let next: Vec<NodeHash> = current
                .chunks(2)
                .map(|chunk| {
                    let left = &chunk[0];
                    let right = chunk.get(1).unwrap_or(left);
                    pair_hash(left, right)
                })
                .collect();
            levels.push(next);
        }

        Self { levels }
    }

    /// Build from hex-encoded leaves (optional `0x` prefix).
    pub fn from_hex_leaves<S: AsRef<str>>(leaves: &[S]) -> Result<Self, MerkleError> {
        let parsed = leaves
            .iter()
            .enumerate()
            .map(|(position, leaf)| {
                parse_hex(leaf.as_ref()).map_err(|e| MerkleError::InvalidLeaf {
                    position,
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::build(parsed))
    }

    /// Root hash, `None` for an empty tree.
    pub fn root(&self) -> Option<NodeHash> {
        self.levels.last()?.first().copied()
    }

    /// Root hash or `EmptyBatch`.
    pub fn require_root(&self) -> Result<NodeHash, MerkleError> {
        self.root().ok_or(MerkleError::EmptyBatch)
    }

    /// Leaf level.
    pub fn leaves(&self) -> &[LeafHash] {
        self.levels.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// All levels, leaves first.
    pub fn levels(&self) -> &[Vec<NodeHash>] {
        &self.levels
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        self.leaves().len()
    }

    /// Number of levels including leaves and root.
    pub fn height(&self) -> usize {
        self.levels.len()
    }

    /// True when the tree has no leaves.
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Index of the first leaf equal to `leaf`.
    pub fn position_of(&self, leaf: &LeafHash) -> Option<usize> {
        self.leaves().iter().position(|l| l == leaf)
    }

    /// Generate the inclusion proof for the leaf at `index`.
    pub fn proof(&self, index: usize) -> Result<InclusionProof, MerkleError> {
        if self.is_empty() {
            return Err(MerkleError::EmptyBatch);
        }
        let leaf_count = self.leaf_count();
        if index >= leaf_count {
            return Err(MerkleError::LeafNotFound { index, leaf_count });
        }

        let mut steps = Vec::with_capacity(self.height().saturating_sub(1));
        let mut current = index;

        // Walk up the tree, collecting sibling hashes
        for level in &self.levels[..self.levels.len() - 1] {
            let (sibling_index, position) = if current % 2 == 0 {
                (current + 1, Position::Right)
            } else {
                (current - 1, Position::Left)
            };
            // Past the end of an odd level the node is paired with itself.
            let hash = level.get(sibling_index).copied().unwrap_or(level[current]);
            steps.push(ProofStep { hash, position });
            current /= 2;
        }

        Ok(InclusionProof { steps })
    }

    /// Shape summary.
    pub fn info(&self) -> TreeInfo {
        TreeInfo {
            leaf_count: self.leaf_count(),
            tree_height: self.height(),
            root: self.root().map(|r| to_hex(&r)),
            levels: self.levels.iter().map(Vec::len).collect(),
        }
    }
}

/// Fold `proof` from `leaf` and compare with `root`.
pub fn verify_inclusion(leaf: &LeafHash, proof: &InclusionProof, root: &NodeHash) -> bool {
    let folded = proof.steps.iter().fold(*leaf, |current, step| match step.position {
        Position::Left => pair_hash(&step.hash, &current),
        Position::Right => pair_hash(&current, &step.hash),
    });
    folded == *root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::hash_bytes;
    use proptest::prelude::*;

    fn leaves(n: usize) -> Vec<LeafHash> {
        (0..n).map(|i| hash_bytes(format!("leaf_{}", i).as_bytes())).collect()
    }

    #[test]
    fn test_empty_tree() {
        let tree = MerkleBatch::build(Vec::new());
        assert_eq!(tree.root(), None);
        assert_eq!(tree.require_root(), Err(MerkleError::EmptyBatch));
        assert_eq!(tree.proof(0), Err(MerkleError::EmptyBatch));
        assert!(tree.proof(0).unwrap_err().is_not_found());
        assert_eq!(tree.info().tree_height, 0);
    }

    #[test]
    fn test_single_leaf_is_root() {
        let leaf = hash_bytes(b"only");
        let tree = MerkleBatch::build(vec![leaf]);
        assert_eq!(tree.root(), Some(leaf));

        let proof = tree.proof(0).unwrap();
        assert!(proof.is_empty());
        assert!(verify_inclusion(&leaf, &proof, &leaf));
    }

    #[test]
    fn test_odd_tail_duplication() {
        let l = leaves(3);
        let (a, b, c) = (l[0], l[1], l[2]);
        let tree = MerkleBatch::build(l);

        let ab = pair_hash(&a, &b);
        let cc = pair_hash(&c, &c);
        assert_eq!(tree.root(), Some(pair_hash(&ab, &cc)));
        assert_eq!(tree.info().levels, vec![3, 2, 1]);

        let proof = tree.proof(2).unwrap();
        assert_eq!(
            proof.steps,
            vec![
                ProofStep { hash: c, position: Position::Right },
                ProofStep { hash: ab, position: Position::Left },
            ]
        );
    }

    #[test]
    fn test_duplication_at_upper_level() {
        // 5 leaves: tail duplicated at levels 0, 1 and 2
        let l = leaves(5);
        let tree = MerkleBatch::build(l.clone());
        assert_eq!(tree.info().levels, vec![5, 3, 2, 1]);

        let l1 = [pair_hash(&l[0], &l[1]), pair_hash(&l[2], &l[3]), pair_hash(&l[4], &l[4])];
        let l2 = [pair_hash(&l1[0], &l1[1]), pair_hash(&l1[2], &l1[2])];
        assert_eq!(tree.root(), Some(pair_hash(&l2[0], &l2[1])));
    }

    #[test]
    fn test_tamper_detection() {
        let l = leaves(6);
        let tree = MerkleBatch::build(l.clone());
        let root = tree.root().unwrap();
        let proof = tree.proof(3).unwrap();

        assert!(verify_inclusion(&l[3], &proof, &root));
        assert!(!verify_inclusion(&hash_bytes(b"tampered"), &proof, &root));

        let mut bad = proof.clone();
        bad.steps[1].hash = hash_bytes(b"forged sibling");
        assert!(!verify_inclusion(&l[3], &bad, &root));

        let mut flipped = proof;
        flipped.steps[0].position = Position::Left;
        assert!(!verify_inclusion(&l[3], &flipped, &root));
    }

    #[test]
    fn test_proof_out_of_bounds() {
        let tree = MerkleBatch::build(leaves(2));
        assert_eq!(
            tree.proof(10),
            Err(MerkleError::LeafNotFound { index: 10, leaf_count: 2 })
        );
    }

    #[test]
    fn test_from_hex_leaves_validates() {
        let good = to_hex(&hash_bytes(b"x"));
        let tree = MerkleBatch::from_hex_leaves(&[good.clone(), format!("0x{}", good)]).unwrap();
        assert_eq!(tree.leaf_count(), 2);

        let err = MerkleBatch::from_hex_leaves(&[good, "abc".to_string()]).unwrap_err();
        assert!(matches!(err, MerkleError::InvalidLeaf { position: 1, .. }));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_proof_wire_shape() {
        let l = leaves(2);
        let tree = MerkleBatch::build(l.clone());
        let json = serde_json::to_value(tree.proof(0).unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{ "hash": to_hex(&l[1]), "position": "right" }])
        );
        let back: InclusionProof = serde_json::from_value(json).unwrap();
        assert_eq!(back, tree.proof(0).unwrap());
    }

    #[test]
    fn test_position_of() {
        let l = leaves(4);
        let tree = MerkleBatch::build(l.clone());
        assert_eq!(tree.position_of(&l[2]), Some(2));
        assert_eq!(tree.position_of(&hash_bytes(b"absent")), None);
    }

    proptest! {
        #[test]
        fn prop_every_leaf_verifies(n in 1usize..70) {
            let l = leaves(n);
            let tree = MerkleBatch::build(l.clone());
            let root = tree.root().unwrap();
            for (i, leaf) in l.iter().enumerate() {
                let proof = tree.proof(i).unwrap();
                prop_assert_eq!(proof.len(), tree.height() - 1);
                prop_assert!(verify_inclusion(leaf, &proof, &root));
            }
        }

        #[test]
        fn prop_level_sizes_halve(n in 1usize..200) {
            let tree = MerkleBatch::build(leaves(n));
            let sizes = tree.info().levels;
            for pair in sizes.windows(2) {
                prop_assert_eq!(pair[1], (pair[0] + 1) / 2);
            }
            prop_assert_eq!(sizes.last().copied(), Some(1));
        }
    }
}
