//! Canopy - deterministic Merkle trees over arbitrarily large leaf sets
//!
//! Builds binary Merkle trees with duplication padding (an unpaired node is
//! hashed with itself), generates membership proofs, and verifies them. Two
//! construction paths produce bit-identical roots:
//!
//! - **In-memory**: [`MerkleTree`] materializes every level for O(height)
//!   proof extraction.
//! - **Streaming**: [`StreamingTreeBuilder`] spills each level to scratch
//!   files so peak memory stays constant in the leaf count.
//!
//! A [`LevelCache`] snapshots a band of upper tree levels to a small,
//! CRC-protected file so later proofs over streamed data only re-hash the
//! bottom of the proof path.
//!
//! # Example
//!
//! ```rust
//! use canopy_core::{verify, MerkleTree, Sha256Hasher};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), canopy_core::TreeError> {
//! let hasher = Arc::new(Sha256Hasher);
//! let leaves: Vec<&[u8]> = vec![b"data1", b"data2", b"data3"];
//!
//! let tree = MerkleTree::build(hasher.clone(), &leaves)?;
//! let proof = tree.generate_proof(2)?;
//! assert!(verify(&proof, tree.root_hash(), hasher.as_ref()));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod hash;
pub mod layout;
pub mod proof;
pub mod stream;
pub mod tree;
mod wire;

// Main API
pub use tree::{MerkleTree, MerkleTreeConfig, TreeError, TreeInfo};

// Hashing
pub use hash::{
    combine, digest_equals, from_hex, to_hex, Blake3Hasher, Digest, MerkleHash, Sha256Hasher,
    Sha512Hasher,
};

// Structure rules
pub use layout::{level_size, sibling_index, sibling_is_right, tree_height};

// Proofs
pub use proof::{verify, Proof, ProofError, ProofStep, PROOF_MAGIC, PROOF_VERSION};

// Partial-tree cache
pub use cache::{
    CacheBand, CacheError, CacheInfo, CacheRequest, CacheStats, LevelCache, CACHE_MAGIC,
    CACHE_VERSION,
};

// Streaming construction
pub use stream::{
    prove_from_leaves, StreamError, StreamingBuildResult, StreamingConfig, StreamingTreeBuilder,
};
