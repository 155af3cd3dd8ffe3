//! In-memory Merkle tree.
//!
//! Materializes every level as a flat row of digests, so proof extraction
//! is O(height) slot reads with no rehashing. Rows replace the pointer
//! tree of classic presentations: node (level, index) lives at
//! `levels[level][index]`, its parent at `levels[level + 1][index / 2]`.

use std::path::Path;
use std::sync::Arc;

use crate::cache::{CacheError, CacheInfo, CacheRequest, CacheStats, LevelCache};
use crate::hash::{combine, to_hex, Digest, MerkleHash};
use crate::layout::{pair_count, sibling_index, sibling_is_right, tree_height};
use crate::proof::{Proof, ProofStep};

/// Tree metadata: the root commitment plus shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeInfo {
    pub root: Digest,
    pub height: u32,
    pub leaf_count: u64,
}

impl std::fmt::Display for TreeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "root={} height={} leaves={}",
            to_hex(&self.root),
            self.height,
            self.leaf_count
        )
    }
}

/// In-memory tree errors.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("cannot build a merkle tree from zero leaves")]
    EmptyLeaves,
    #[error("leaf index {index} out of range for {leaf_count} leaves")]
    IndexOutOfRange { index: u64, leaf_count: u64 },
    #[error("no cache was configured for this tree")]
    CacheDisabled,
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Configuration for in-memory construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct MerkleTreeConfig {
    cache: Option<CacheRequest>,
}

impl MerkleTreeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain the top `k` levels below the root in a [`LevelCache`].
    pub fn with_top_levels(mut self, k: u32) -> Self {
        self.cache = Some(CacheRequest::TopLevels(k));
        self
    }

    /// Retain an explicit inclusive band of levels in a [`LevelCache`].
    pub fn with_cache_band(mut self, start: u32, end: u32) -> Self {
        self.cache = Some(CacheRequest::Band { start, end });
        self
    }
}

/// A fully materialized Merkle tree over an owned leaf sequence.
///
/// Immutable after construction, apart from cache lookup counters.
pub struct MerkleTree<H: MerkleHash> {
    hasher: Arc<H>,
    leaves: Vec<Vec<u8>>,
    levels: Vec<Vec<Digest>>,
    cache: Option<LevelCache>,
}

impl<H: MerkleHash> MerkleTree<H> {
    /// Build a tree from a finite leaf sequence.
    pub fn build<L: AsRef<[u8]>>(hasher: Arc<H>, leaves: &[L]) -> Result<Self, TreeError> {
        Self::build_with(hasher, leaves, MerkleTreeConfig::new())
    }

    /// Build a tree, optionally populating a cache band along the way.
    pub fn build_with<L: AsRef<[u8]>>(
        hasher: Arc<H>,
        leaves: &[L],
        config: MerkleTreeConfig,
    ) -> Result<Self, TreeError> {
        if leaves.is_empty() {
            return Err(TreeError::EmptyLeaves);
        }
        let leaf_count = leaves.len() as u64;
        let height = tree_height(leaf_count);

        let cache = match config.cache {
            Some(request) => Some(LevelCache::empty(
                request.resolve(height)?,
                hasher.name(),
                hasher.digest_size(),
                height,
                leaf_count,
            )?),
            None => None,
        };

        let mut levels: Vec<Vec<Digest>> = Vec::with_capacity(height as usize + 1);
        let mut current: Vec<Digest> = leaves
            .iter()
            .map(|leaf| hasher.hash(leaf.as_ref()))
            .collect();

        loop {
            let level = levels.len() as u32;
            if let Some(cache) = &cache {
                if cache.band().contains(level) {
                    for (index, digest) in current.iter().enumerate() {
                        cache.insert(level, index as u64, digest.clone())?;
                    }
                }
            }

            if current.len() == 1 {
                levels.push(current);
                break;
            }

            let mut next = Vec::with_capacity(pair_count(current.len() as u64) as usize);
            let mut i = 0;
            while i < current.len() {
                let left = &current[i];
                // Duplication padding: an unpaired last node hashes with itself.
                let right = current.get(i + 1).unwrap_or(left);
                next.push(combine(hasher.as_ref(), left, right));
                i += 2;
            }
            levels.push(current);
            current = next;
        }

        Ok(Self {
            hasher,
            leaves: leaves.iter().map(|l| l.as_ref().to_vec()).collect(),
            levels,
            cache,
        })
    }

    /// Digest of the root node.
    pub fn root_hash(&self) -> &Digest {
        &self.levels[self.levels.len() - 1][0]
    }

    /// Height of the tree: 0 for a single leaf.
    pub fn height(&self) -> u32 {
        (self.levels.len() - 1) as u32
    }

    /// Number of leaves the tree was built over.
    pub fn leaf_count(&self) -> u64 {
        self.leaves.len() as u64
    }

    /// The hash implementation the tree was built with.
    pub fn hasher(&self) -> &H {
        &self.hasher
    }

    /// Root, height, and leaf count in one record.
    pub fn info(&self) -> TreeInfo {
        TreeInfo {
            root: self.root_hash().clone(),
            height: self.height(),
            leaf_count: self.leaf_count(),
        }
    }

    /// Extract the membership proof for the leaf at `leaf_index`.
    pub fn generate_proof(&self, leaf_index: u64) -> Result<Proof, TreeError> {
        let leaf_count = self.leaf_count();
        if leaf_index >= leaf_count {
            return Err(TreeError::IndexOutOfRange {
                index: leaf_index,
                leaf_count,
            });
        }

        let height = self.height();
        let mut steps = Vec::with_capacity(height as usize);
        let mut index = leaf_index;
        for level in 0..height {
            let row = &self.levels[level as usize];
            let sibling = sibling_index(index);
            let digest = match row.get(sibling as usize) {
                Some(d) => d.clone(),
                // Duplication padding: the sibling is the node itself.
                None => row[index as usize].clone(),
            };
            steps.push(ProofStep {
                sibling: digest,
                sibling_on_right: sibling_is_right(index),
            });
            index /= 2;
        }

        Ok(Proof {
            leaf: self.leaves[leaf_index as usize].clone(),
            leaf_index,
            tree_height: height,
            steps,
        })
    }

    /// Whether a cache band was configured and populated.
    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// The populated cache, when one was configured.
    pub fn cache(&self) -> Option<&LevelCache> {
        self.cache.as_ref()
    }

    /// Metadata of the configured cache.
    pub fn cache_info(&self) -> Result<CacheInfo, TreeError> {
        self.cache
            .as_ref()
            .map(|c| c.info())
            .ok_or(TreeError::CacheDisabled)
    }

    /// Lookup counters of the configured cache.
    pub fn cache_stats(&self) -> Result<CacheStats, TreeError> {
        self.cache
            .as_ref()
            .map(|c| c.stats())
            .ok_or(TreeError::CacheDisabled)
    }

    /// Persist the configured cache to `path`.
    pub fn save_cache<P: AsRef<Path>>(&self, path: P) -> Result<(), TreeError> {
        let cache = self.cache.as_ref().ok_or(TreeError::CacheDisabled)?;
        cache.save(path)?;
        Ok(())
    }
}
