//! Partial-tree cache: a persistable snapshot of a band of upper levels.
//!
//! After a streaming build the full tree is gone, but proofs only need the
//! top of the tree to be cheap: the bottom of a proof path is recomputed
//! from a small leaf window, while everything above comes from the cache in
//! O(1) per lookup. The cache is a dense map (level, index) -> digest over
//! a contiguous band of levels, with a bytewise file format protected by a
//! CRC-32 trailer.
//!
//! Level data is immutable once written; only the statistics counters
//! mutate, so lookups share the cache freely.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use tracing::debug;

use crate::hash::Digest;
use crate::layout::{level_size, tree_height};
use crate::wire::ByteReader;

/// Wire magic for cache files.
pub const CACHE_MAGIC: &[u8; 8] = b"MTCACHE\0";

/// Current cache file-format version.
pub const CACHE_VERSION: u32 = 1;

/// Cache errors: invalid bands, format violations, and I/O failures.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("invalid cache band: {0}")]
    InvalidBand(String),
    #[error("level {level} is outside the cache band {start}..={end}")]
    LevelOutOfBand { level: u32, start: u32, end: u32 },
    #[error("node index {index} out of range for level {level} ({size} nodes)")]
    IndexOutOfRange { level: u32, index: u64, size: u64 },
    #[error("digest width {got} does not match cache digest size {expected}")]
    DigestWidth { got: usize, expected: usize },
    #[error("bad cache magic")]
    BadMagic,
    #[error("unsupported cache version {0}")]
    UnsupportedVersion(u32),
    #[error("cache file truncated reading {0}")]
    Truncated(&'static str),
    #[error("invalid cache header: {0}")]
    InvalidHeader(&'static str),
    #[error("cache checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("cache level sequence broken: found {found}, expected {expected}")]
    LevelSequence { found: u32, expected: u32 },
    #[error("level {level} holds {got} nodes, expected {expected}")]
    LevelLength { level: u32, got: u64, expected: u64 },
    #[error("{0} trailing bytes after cache levels")]
    TrailingBytes(usize),
    #[error("cache was built with hash \"{cache_hash}\", not \"{requested}\"")]
    HashNameMismatch { cache_hash: String, requested: String },
    #[error("cache covers {cache} leaves, but the leaf set has {supplied}")]
    LeafCountMismatch { cache: u64, supplied: u64 },
    #[error("cannot save cache: level {level} is missing node {index}")]
    IncompleteLevel { level: u32, index: u64 },
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A contiguous, inclusive range of cached levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheBand {
    pub start: u32,
    pub end: u32,
}

impl CacheBand {
    /// Whether `level` falls inside the band.
    #[inline]
    pub fn contains(&self, level: u32) -> bool {
        level >= self.start && level <= self.end
    }
}

impl std::fmt::Display for CacheBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// How a caller asks for a cache band before the tree height is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRequest {
    /// The top `k` levels below the root: resolves to
    /// `(height - k, height - 1)`, clamped to level 0 when `k` exceeds the
    /// height. The root is excluded; it travels with the tree metadata.
    TopLevels(u32),
    /// An explicit inclusive level range.
    Band { start: u32, end: u32 },
}

impl CacheRequest {
    /// Validate the request against a concrete tree height.
    pub fn resolve(self, height: u32) -> Result<CacheBand, CacheError> {
        match self {
            CacheRequest::TopLevels(0) => Err(CacheError::InvalidBand(
                "top-levels request must cover at least one level".to_string(),
            )),
            CacheRequest::TopLevels(_) if height == 0 => Err(CacheError::InvalidBand(
                "a single-leaf tree has no levels below the root".to_string(),
            )),
            CacheRequest::TopLevels(k) => Ok(CacheBand {
                start: height.saturating_sub(k),
                end: height - 1,
            }),
            CacheRequest::Band { start, end } => {
                if end < start {
                    return Err(CacheError::InvalidBand(format!(
                        "end level {end} is below start level {start}"
                    )));
                }
                if end > height {
                    return Err(CacheError::InvalidBand(format!(
                        "end level {end} exceeds tree height {height}"
                    )));
                }
                Ok(CacheBand { start, end })
            }
        }
    }
}

/// Immutable cache metadata, as recorded in the file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    pub hash_name: String,
    pub digest_size: usize,
    pub tree_height: u32,
    pub leaf_count: u64,
    pub band: CacheBand,
}

/// Snapshot of the lookup counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_lookups: u64,
}

impl CacheStats {
    /// Hit percentage over all lookups; 0.0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        if self.total_lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.total_lookups as f64 * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// A dense digest snapshot of the levels in one [`CacheBand`].
///
/// Rows fill in one of three ways: the in-memory builder populates the band
/// while constructing, the streaming builder captures the band as level
/// files pass through, or [`LevelCache::load`] reads a persisted file.
/// Proof generation may also fill holes lazily through [`insert`].
///
/// [`insert`]: LevelCache::insert
#[derive(Debug)]
pub struct LevelCache {
    hash_name: String,
    digest_size: usize,
    tree_height: u32,
    leaf_count: u64,
    band: CacheBand,
    rows: Vec<Vec<OnceLock<Digest>>>,
    stats: StatCounters,
}

impl LevelCache {
    /// Create an unpopulated cache over `band` for a tree of the given
    /// shape.
    pub fn empty(
        band: CacheBand,
        hash_name: &str,
        digest_size: usize,
        height: u32,
        leaf_count: u64,
    ) -> Result<Self, CacheError> {
        if leaf_count == 0 {
            return Err(CacheError::InvalidHeader("leaf count is zero"));
        }
        if digest_size == 0 {
            return Err(CacheError::InvalidHeader("digest size is zero"));
        }
        if band.end < band.start || band.end > height {
            return Err(CacheError::InvalidBand(format!(
                "band {band} does not fit a tree of height {height}"
            )));
        }

        let rows = (band.start..=band.end)
            .map(|level| {
                let size = level_size(leaf_count, level) as usize;
                (0..size).map(|_| OnceLock::new()).collect()
            })
            .collect();

        Ok(Self {
            hash_name: hash_name.to_string(),
            digest_size,
            tree_height: height,
            leaf_count,
            band,
            rows,
            stats: StatCounters::default(),
        })
    }

    /// The band of levels this cache covers.
    pub fn band(&self) -> CacheBand {
        self.band
    }

    /// Name of the hash algorithm the digests were produced with.
    pub fn hash_name(&self) -> &str {
        &self.hash_name
    }

    /// Width of every digest in the cache.
    pub fn digest_size(&self) -> usize {
        self.digest_size
    }

    /// Height of the tree the cache was built from.
    pub fn tree_height(&self) -> u32 {
        self.tree_height
    }

    /// Leaf count of the tree the cache was built from.
    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    /// Metadata snapshot matching the file header.
    pub fn info(&self) -> CacheInfo {
        CacheInfo {
            hash_name: self.hash_name.clone(),
            digest_size: self.digest_size,
            tree_height: self.tree_height,
            leaf_count: self.leaf_count,
            band: self.band,
        }
    }

    /// Fail unless the cache was produced by the named hash algorithm.
    /// Names are compared byte-for-byte.
    pub fn ensure_hash(&self, name: &str) -> Result<(), CacheError> {
        if self.hash_name != name {
            return Err(CacheError::HashNameMismatch {
                cache_hash: self.hash_name.clone(),
                requested: name.to_string(),
            });
        }
        Ok(())
    }

    /// Fail unless the cache describes a tree over `leaf_count` leaves.
    pub fn ensure_leaf_count(&self, leaf_count: u64) -> Result<(), CacheError> {
        if self.leaf_count != leaf_count {
            return Err(CacheError::LeafCountMismatch {
                cache: self.leaf_count,
                supplied: leaf_count,
            });
        }
        Ok(())
    }

    fn row(&self, level: u32) -> Option<&Vec<OnceLock<Digest>>> {
        self.band
            .contains(level)
            .then(|| &self.rows[(level - self.band.start) as usize])
    }

    /// Record the digest of node (`level`, `index`). A slot that already
    /// holds a digest keeps its original value.
    pub fn insert(&self, level: u32, index: u64, digest: Digest) -> Result<(), CacheError> {
        if digest.len() != self.digest_size {
            return Err(CacheError::DigestWidth {
                got: digest.len(),
                expected: self.digest_size,
            });
        }
        let row = self.row(level).ok_or(CacheError::LevelOutOfBand {
            level,
            start: self.band.start,
            end: self.band.end,
        })?;
        let slot = row.get(index as usize).ok_or(CacheError::IndexOutOfRange {
            level,
            index,
            size: row.len() as u64,
        })?;
        let _ = slot.set(digest);
        Ok(())
    }

    /// Fetch the digest of node (`level`, `index`), counting a hit or miss.
    /// Out-of-band positions and unpopulated slots are misses.
    pub fn lookup(&self, level: u32, index: u64) -> Option<Digest> {
        let found = self
            .row(level)
            .and_then(|row| row.get(index as usize))
            .and_then(|slot| slot.get())
            .cloned();
        match found {
            Some(_) => self.stats.hits.fetch_add(1, Ordering::Relaxed),
            None => self.stats.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Whether every slot in every band level is populated.
    pub fn is_complete(&self) -> bool {
        self.rows
            .iter()
            .all(|row| row.iter().all(|slot| slot.get().is_some()))
    }

    /// Current lookup counters.
    pub fn stats(&self) -> CacheStats {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        CacheStats {
            hits,
            misses,
            total_lookups: hits + misses,
        }
    }

    /// Zero the lookup counters.
    pub fn reset_stats(&self) {
        self.stats.hits.store(0, Ordering::Relaxed);
        self.stats.misses.store(0, Ordering::Relaxed);
    }

    /// Serialize to the versioned cache file format. Fails if any band slot
    /// is still unpopulated; statistics are not persisted.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CacheError> {
        let path = path.as_ref();
        let mut out = Vec::new();

        out.extend_from_slice(CACHE_MAGIC);
        out.extend_from_slice(&CACHE_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.hash_name.len() as u32).to_le_bytes());
        out.extend_from_slice(self.hash_name.as_bytes());
        out.extend_from_slice(&(self.digest_size as u32).to_le_bytes());
        out.extend_from_slice(&self.tree_height.to_le_bytes());
        out.extend_from_slice(&self.leaf_count.to_le_bytes());
        out.extend_from_slice(&self.band.start.to_le_bytes());
        out.extend_from_slice(&self.band.end.to_le_bytes());

        for (offset, row) in self.rows.iter().enumerate() {
            let level = self.band.start + offset as u32;
            out.extend_from_slice(&level.to_le_bytes());
            out.extend_from_slice(&(row.len() as u64).to_le_bytes());
            for (index, slot) in row.iter().enumerate() {
                let digest = slot.get().ok_or(CacheError::IncompleteLevel {
                    level,
                    index: index as u64,
                })?;
                out.extend_from_slice(digest);
            }
        }

        out.extend_from_slice(&crc32fast::hash(&out).to_le_bytes());

        // Atomic replace: write beside the target, then rename over it.
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &out)?;
        std::fs::rename(&tmp, path)?;

        debug!(
            path = %path.display(),
            bytes = out.len(),
            levels = self.rows.len(),
            "cache saved"
        );
        Ok(())
    }

    /// Read and validate a cache file. Statistics start at zero.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        if data.len() < CACHE_MAGIC.len() + 4 {
            return Err(CacheError::Truncated("header"));
        }

        let (payload, trailer) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes(trailer.try_into().unwrap());
        let computed = crc32fast::hash(payload);
        if stored != computed {
            return Err(CacheError::ChecksumMismatch { stored, computed });
        }

        let mut r = ByteReader::new(payload);
        let magic = r.take(8).ok_or(CacheError::Truncated("magic"))?;
        if magic != CACHE_MAGIC {
            return Err(CacheError::BadMagic);
        }
        let version = r.u32_le().ok_or(CacheError::Truncated("version"))?;
        if version != CACHE_VERSION {
            return Err(CacheError::UnsupportedVersion(version));
        }

        let name_len = r.u32_le().ok_or(CacheError::Truncated("hash name length"))?;
        let name_bytes = r
            .take(name_len as usize)
            .ok_or(CacheError::Truncated("hash name"))?;
        let hash_name = std::str::from_utf8(name_bytes)
            .map_err(|_| CacheError::InvalidHeader("hash name is not UTF-8"))?
            .to_string();

        let digest_size = r.u32_le().ok_or(CacheError::Truncated("digest size"))? as usize;
        let height = r.u32_le().ok_or(CacheError::Truncated("tree height"))?;
        let leaf_count = r.u64_le().ok_or(CacheError::Truncated("leaf count"))?;
        let start = r.u32_le().ok_or(CacheError::Truncated("start level"))?;
        let end = r.u32_le().ok_or(CacheError::Truncated("end level"))?;

        if tree_height(leaf_count) != height {
            return Err(CacheError::InvalidHeader(
                "tree height does not match leaf count",
            ));
        }

        let cache = Self::empty(
            CacheBand { start, end },
            &hash_name,
            digest_size,
            height,
            leaf_count,
        )?;

        for level in start..=end {
            let found = r.u32_le().ok_or(CacheError::Truncated("level index"))?;
            if found != level {
                return Err(CacheError::LevelSequence {
                    found,
                    expected: level,
                });
            }
            let node_count = r.u64_le().ok_or(CacheError::Truncated("node count"))?;
            let expected = level_size(leaf_count, level);
            if node_count != expected {
                return Err(CacheError::LevelLength {
                    level,
                    got: node_count,
                    expected,
                });
            }
            for index in 0..node_count {
                let digest = r
                    .take(digest_size)
                    .ok_or(CacheError::Truncated("level digests"))?;
                cache.insert(level, index, digest.to_vec())?;
            }
        }

        if !r.is_empty() {
            return Err(CacheError::TrailingBytes(r.remaining()));
        }

        debug!(
            path = %path.display(),
            hash = %cache.hash_name,
            band = %cache.band,
            "cache loaded"
        );
        Ok(cache)
    }
}

/// Equality over metadata and level contents; statistics are ignored.
impl PartialEq for LevelCache {
    fn eq(&self, other: &Self) -> bool {
        self.hash_name == other.hash_name
            && self.digest_size == other.digest_size
            && self.tree_height == other.tree_height
            && self.leaf_count == other.leaf_count
            && self.band == other.band
            && self.rows.len() == other.rows.len()
            && self.rows.iter().zip(&other.rows).all(|(a, b)| {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| x.get() == y.get())
            })
    }
}
