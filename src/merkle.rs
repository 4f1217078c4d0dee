//! Merkle tree over hex digests
//!
//! Used at two scales:
//!
//! - **Block level**: every chain block carries the root over its own
//!   `{digest_a, digest_b}` pair.
//! - **Snapshot level**: an integrity snapshot summarizes the live combined
//!   digests of every tracked file (in path order) as one root.
//!
//! ## Tree Structure
//!
//! ```text
//!          Root Hash
//!         /         \
//!     N(A,B)        L(C)
//!    /      \         │
//!  L(A)    L(B)       C     (odd node promoted unchanged)
//!   │        │
//!   A        B
//! ```
//!
//! Levels are kept as plain vectors (level 0 = leaves), so inclusion proofs
//! are read straight out of the arena without walking pointers.
//!
//! Leaves are hashed as `SHA-256(0x00 || leaf)` and internal nodes as
//! `SHA-256(0x01 || left || right)` over the hex of the children, so a leaf
//! list can never produce the same root as a list of internal nodes. An
//! odd node at the end of a level moves up without being hashed again.
//! An empty tree has no root; [`merkle_root`] maps that to [`ZERO_DIGEST`].

use crate::utils::ZERO_DIGEST;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::trace;

/// Which side a sibling sits on in an inclusion proof
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// Sibling is the left child
    Left,
    /// Sibling is the right child
    Right,
}

/// One step of an inclusion proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    /// Hash of the sibling node
    pub sibling: String,
    /// Side of the sibling
    pub side: Side,
}

/// Merkle tree built from a list of leaf digests
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    levels: Vec<Vec<String>>,
}

impl MerkleTree {
    /// Create a new empty Merkle tree
    pub fn new() -> Self {
        Self { levels: Vec::new() }
    }

    /// Build a tree from leaf digests
    ///
    /// # Example
    ///
    /// ```rust
    /// use docseal::merkle::MerkleTree;
    ///
    /// let tree = MerkleTree::from_leaves(&["aa".to_string(), "bb".to_string()]);
    /// assert_eq!(tree.leaf_count(), 2);
    /// assert_eq!(tree.root_hash().map(|h| h.len()), Some(64));
    /// ```
    pub fn from_leaves(leaves: &[String]) -> Self {
        if leaves.is_empty() {
            return Self::new();
        }

        let hashed: Vec<String> = leaves.iter().map(|leaf| compute_leaf_hash(leaf)).collect();
        let mut levels = vec![hashed];
        while levels.last().map_or(false, |level| level.len() > 1) {
            let current = &levels[levels.len() - 1];
            let next: Vec<String> = current
                .chunks(2)
                .map(|pair| match pair.get(1) {
                    Some(right) => compute_internal_hash(&pair[0], right),
                    None => pair[0].clone(),
                })
                .collect();
            levels.push(next);
        }

        trace!("Built Merkle tree with {} leaves", leaves.len());
        Self { levels }
    }

    /// Get the root hash of the tree (`None` if empty)
    ///
    /// A single-leaf tree's root is the hash of that leaf.
    pub fn root_hash(&self) -> Option<String> {
        self.levels.last().and_then(|level| level.first()).cloned()
    }

    /// Number of leaves
    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    /// Inclusion proof for the leaf at `index`
    pub fn proof(&self, index: usize) -> Option<Vec<ProofStep>> {
        if index >= self.leaf_count() {
            return None;
        }

        let mut steps = Vec::new();
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let (sibling_idx, side) = if idx % 2 == 0 {
                (idx + 1, Side::Right)
            } else {
                (idx - 1, Side::Left)
            };
            // A promoted odd node has no sibling at this level
            if let Some(sibling) = level.get(sibling_idx) {
                steps.push(ProofStep {
                    sibling: sibling.clone(),
                    side,
                });
            }
            idx /= 2;
        }
        Some(steps)
    }
}

/// Check an inclusion proof against a root
///
/// ```rust
/// use docseal::merkle::{verify_proof, MerkleTree};
///
/// let leaves: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
/// let tree = MerkleTree::from_leaves(&leaves);
/// let root = tree.root_hash().unwrap();
/// let proof = tree.proof(2).unwrap();
/// assert!(verify_proof("c", &proof, &root));
/// assert!(!verify_proof("x", &proof, &root));
/// ```
pub fn verify_proof(leaf: &str, proof: &[ProofStep], root: &str) -> bool {
    let computed = proof.iter().fold(compute_leaf_hash(leaf), |acc, step| match step.side {
        Side::Left => compute_internal_hash(&step.sibling, &acc),
        Side::Right => compute_internal_hash(&acc, &step.sibling),
    });
    computed == root
}

/// Root over `leaves`, or [`ZERO_DIGEST`] for an empty set
pub fn merkle_root(leaves: &[String]) -> String {
    MerkleTree::from_leaves(leaves)
        .root_hash()
        .unwrap_or_else(|| ZERO_DIGEST.to_string())
}

const LEAF_TAG: [u8; 1] = [0x00];
const NODE_TAG: [u8; 1] = [0x01];

/// Compute hash for a leaf
fn compute_leaf_hash(leaf: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(LEAF_TAG);
    hasher.update(leaf);
    hex::encode(hasher.finalize())
}

/// Compute hash for an internal node
fn compute_internal_hash(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(NODE_TAG);
    hasher.update(left);
    hasher.update(right);
    hex::encode(hasher.finalize())
}
