//! Streaming tree construction over scratch files.
//!
//! Leaves arrive from an async producer and are hashed as they arrive;
//! each tree level is spilled to a length-prefixed scratch file and read
//! back two digests at a time to produce the next level. Peak memory is
//! constant in the leaf count (a requested cache band is the one
//! exception, sized by the band itself).
//!
//! Scratch files live in a uniquely named directory that is removed
//! recursively on every exit path; cleanup failures are swallowed so they
//! never mask the primary error. Cancellation is a cooperative flag
//! checked at each suspension point.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tempfile::TempDir;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, warn};

use crate::cache::{CacheError, CacheRequest, LevelCache};
use crate::hash::{combine, Digest, MerkleHash};
use crate::layout::{level_size, pair_count, sibling_index, sibling_is_right, tree_height};
use crate::proof::{Proof, ProofStep};
use crate::tree::{TreeError, TreeInfo};

/// Streaming build errors.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("leaf producer yielded no leaves")]
    EmptyInput,
    #[error("streaming build cancelled")]
    Cancelled,
    #[error("scratch {op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("leaf producer failed: {0}")]
    Producer(String),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

impl StreamError {
    fn io(op: &'static str, source: std::io::Error) -> Self {
        Self::Io { op, source }
    }
}

/// Configuration for streaming construction.
#[derive(Debug, Clone, Default)]
pub struct StreamingConfig {
    cache: Option<CacheRequest>,
    cancel: Option<Arc<AtomicBool>>,
    scratch_parent: Option<PathBuf>,
}

impl StreamingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the top `k` levels below the root into a [`LevelCache`]
    /// while building.
    pub fn with_top_levels(mut self, k: u32) -> Self {
        self.cache = Some(CacheRequest::TopLevels(k));
        self
    }

    /// Capture an explicit inclusive band of levels into a [`LevelCache`]
    /// while building.
    pub fn with_cache_band(mut self, start: u32, end: u32) -> Self {
        self.cache = Some(CacheRequest::Band { start, end });
        self
    }

    /// Cooperative cancellation: when the flag becomes true the build
    /// stops at its next suspension point, cleans up, and returns
    /// [`StreamError::Cancelled`].
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Create the scratch directory inside `dir` instead of the system
    /// temp location.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_parent = Some(dir.into());
        self
    }
}

/// Outcome of a streaming build: the tree metadata, plus the captured
/// cache when one was requested.
#[derive(Debug)]
pub struct StreamingBuildResult {
    pub info: TreeInfo,
    pub cache: Option<LevelCache>,
}

/// Builds a Merkle tree from an async leaf producer without holding the
/// tree in memory.
pub struct StreamingTreeBuilder<H: MerkleHash> {
    hasher: Arc<H>,
    config: StreamingConfig,
}

impl<H: MerkleHash> StreamingTreeBuilder<H> {
    pub fn new(hasher: Arc<H>) -> Self {
        Self::with_config(hasher, StreamingConfig::new())
    }

    pub fn with_config(hasher: Arc<H>, config: StreamingConfig) -> Self {
        Self { hasher, config }
    }

    /// Consume `leaves` to completion and return the tree metadata.
    ///
    /// Leaves are processed in producer order; level k is fully written
    /// before level k+1 begins. Producer errors, I/O errors, and
    /// cancellation all tear down the scratch directory before returning.
    pub async fn build<S, B>(&self, mut leaves: S) -> Result<StreamingBuildResult, StreamError>
    where
        S: Stream<Item = Result<B, StreamError>> + Unpin,
        B: AsRef<[u8]>,
    {
        let scratch = self.create_scratch()?;
        debug!(dir = %scratch.path().display(), hash = self.hasher.name(), "streaming build started");

        let result = self.build_inner(&scratch, &mut leaves).await;

        // Recursive scratch removal on success and failure alike; a
        // cleanup failure must not mask the build outcome.
        let _ = scratch.close();
        result
    }

    /// Convenience wrapper over [`build`] for synchronous leaf sequences.
    ///
    /// [`build`]: StreamingTreeBuilder::build
    pub async fn build_iter<I, B>(&self, leaves: I) -> Result<StreamingBuildResult, StreamError>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        self.build(futures::stream::iter(
            leaves.into_iter().map(Ok::<B, StreamError>),
        ))
        .await
    }

    async fn build_inner<S, B>(
        &self,
        scratch: &TempDir,
        leaves: &mut S,
    ) -> Result<StreamingBuildResult, StreamError>
    where
        S: Stream<Item = Result<B, StreamError>> + Unpin,
        B: AsRef<[u8]>,
    {
        let mut capture = self.config.cache.map(BandCapture::new);

        // Leaf phase: hash each payload into the level-0 file.
        let level0_path = scratch.path().join("level-0.bin");
        let file = File::create(&level0_path)
            .await
            .map_err(|e| StreamError::io("level file creation", e))?;
        let mut writer = BufWriter::new(file);

        let mut leaf_row = capture
            .as_ref()
            .and_then(BandCapture::leaf_capture)
            .map(|cap| (Vec::new(), cap));
        let mut leaf_count = 0u64;
        let mut root: Option<Digest> = None;

        while let Some(item) = leaves.next().await {
            self.check_cancel()?;
            let leaf = item?;
            let digest = self.hasher.hash(leaf.as_ref());
            write_frame(&mut writer, &digest).await?;

            let mut overflow = false;
            if let Some((row, cap)) = leaf_row.as_mut() {
                row.push(digest.clone());
                overflow = cap.is_some_and(|cap| row.len() as u64 > cap);
            }
            if overflow {
                leaf_row = None;
            }

            root = Some(digest);
            leaf_count += 1;
        }
        writer
            .flush()
            .await
            .map_err(|e| StreamError::io("level file flush", e))?;

        let mut root = root.ok_or(StreamError::EmptyInput)?;
        debug!(leaf_count, "leaf level complete");

        if let (Some(capture), Some((row, _))) = (capture.as_mut(), leaf_row) {
            capture.push_row(0, row);
        }

        // Reduction phase: pair each level into the next until one digest
        // remains.
        let mut count = leaf_count;
        let mut level = 0u32;
        let mut current_path = level0_path;

        while count > 1 {
            self.check_cancel()?;
            let parent_level = level + 1;
            let parent_count = pair_count(count);
            let next_path = scratch.path().join(format!("level-{parent_level}.bin"));

            let mut reader = BufReader::new(
                File::open(&current_path)
                    .await
                    .map_err(|e| StreamError::io("level file open", e))?,
            );
            let mut writer = BufWriter::new(
                File::create(&next_path)
                    .await
                    .map_err(|e| StreamError::io("level file creation", e))?,
            );

            let capturing = capture
                .as_ref()
                .is_some_and(|c| c.wants(parent_level, parent_count));
            let mut row: Vec<Digest> = Vec::new();

            while let Some(left) = read_frame(&mut reader).await? {
                self.check_cancel()?;
                let parent = match read_frame(&mut reader).await? {
                    Some(right) => combine(self.hasher.as_ref(), &left, &right),
                    // Duplication padding: an unpaired last node hashes
                    // with itself.
                    None => combine(self.hasher.as_ref(), &left, &left),
                };
                write_frame(&mut writer, &parent).await?;
                if capturing {
                    row.push(parent.clone());
                }
                root = parent;
            }
            writer
                .flush()
                .await
                .map_err(|e| StreamError::io("level file flush", e))?;

            if capturing {
                if let Some(capture) = capture.as_mut() {
                    capture.push_row(parent_level, row);
                }
            }

            // The consumed level is dead weight from here on.
            if let Err(e) = tokio::fs::remove_file(&current_path).await {
                warn!(path = %current_path.display(), error = %e, "consumed level file not deleted");
            }
            debug!(level = parent_level, nodes = parent_count, "level built");

            count = parent_count;
            level = parent_level;
            current_path = next_path;
        }

        let height = tree_height(leaf_count);
        let cache = match capture {
            Some(capture) => Some(capture.into_cache(
                self.hasher.name(),
                self.hasher.digest_size(),
                height,
                leaf_count,
            )?),
            None => None,
        };

        let info = TreeInfo {
            root,
            height,
            leaf_count,
        };
        debug!(%info, "streaming build complete");
        Ok(StreamingBuildResult { info, cache })
    }

    fn create_scratch(&self) -> Result<TempDir, StreamError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("canopy-build-");
        let dir = match &self.config.scratch_parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|e| StreamError::io("scratch directory creation", e))?;
        Ok(dir)
    }

    fn check_cancel(&self) -> Result<(), StreamError> {
        if let Some(flag) = &self.config.cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(StreamError::Cancelled);
            }
        }
        Ok(())
    }
}

/// Captures level rows during a streaming build, before the final height
/// (and therefore the resolved band) is known.
///
/// Explicit bands capture exactly their levels. Top-k requests capture
/// every level of at most 2^k nodes, which bounds memory and is a
/// superset of the top k levels; the surplus is discarded at resolution.
struct BandCapture {
    request: CacheRequest,
    top_limit: Option<u64>,
    rows: Vec<(u32, Vec<Digest>)>,
}

impl BandCapture {
    fn new(request: CacheRequest) -> Self {
        let top_limit = match request {
            CacheRequest::TopLevels(k) => Some(1u64.checked_shl(k.min(63)).unwrap_or(u64::MAX)),
            CacheRequest::Band { .. } => None,
        };
        Self {
            request,
            top_limit,
            rows: Vec::new(),
        }
    }

    /// Whether the leaf level should be captured, and under what node
    /// cap (`None` = uncapped, for explicit bands starting at 0).
    fn leaf_capture(&self) -> Option<Option<u64>> {
        match self.request {
            CacheRequest::TopLevels(_) => Some(self.top_limit),
            CacheRequest::Band { start: 0, .. } => Some(None),
            CacheRequest::Band { .. } => None,
        }
    }

    fn wants(&self, level: u32, size: u64) -> bool {
        match (self.request, self.top_limit) {
            (CacheRequest::TopLevels(_), Some(limit)) => size <= limit,
            (CacheRequest::TopLevels(_), None) => false,
            (CacheRequest::Band { start, end }, _) => level >= start && level <= end,
        }
    }

    fn push_row(&mut self, level: u32, digests: Vec<Digest>) {
        self.rows.push((level, digests));
    }

    fn into_cache(
        self,
        hash_name: &str,
        digest_size: usize,
        height: u32,
        leaf_count: u64,
    ) -> Result<LevelCache, CacheError> {
        let band = self.request.resolve(height)?;
        let cache = LevelCache::empty(band, hash_name, digest_size, height, leaf_count)?;
        for (level, digests) in self.rows {
            if !band.contains(level) {
                continue;
            }
            for (index, digest) in digests.into_iter().enumerate() {
                cache.insert(level, index as u64, digest)?;
            }
        }
        Ok(cache)
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    digest: &[u8],
) -> Result<(), StreamError> {
    writer
        .write_all(&(digest.len() as u32).to_le_bytes())
        .await
        .map_err(|e| StreamError::io("frame length write", e))?;
    writer
        .write_all(digest)
        .await
        .map_err(|e| StreamError::io("frame digest write", e))?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Digest>, StreamError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(StreamError::io("frame length read", e)),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut digest = vec![0u8; len];
    reader
        .read_exact(&mut digest)
        .await
        .map_err(|e| StreamError::io("frame digest read", e))?;
    Ok(Some(digest))
}

/// Generate a membership proof from a restartable leaf sequence without a
/// materialized tree.
///
/// Only the sibling digests along the proof path are computed. When a
/// cache is supplied it is consulted before any recomputation; recomputed
/// in-band nodes are inserted back into the cache. The cache must have
/// been produced by the same hash algorithm over the same leaf count.
pub fn prove_from_leaves<H, L>(
    hasher: &H,
    leaves: &[L],
    leaf_index: u64,
    cache: Option<&LevelCache>,
) -> Result<Proof, TreeError>
where
    H: MerkleHash + ?Sized,
    L: AsRef<[u8]>,
{
    let leaf_count = leaves.len() as u64;
    if leaf_count == 0 {
        return Err(TreeError::EmptyLeaves);
    }
    if leaf_index >= leaf_count {
        return Err(TreeError::IndexOutOfRange {
            index: leaf_index,
            leaf_count,
        });
    }
    if let Some(cache) = cache {
        cache.ensure_hash(hasher.name())?;
        cache.ensure_leaf_count(leaf_count)?;
    }

    let height = tree_height(leaf_count);
    let mut steps = Vec::with_capacity(height as usize);
    let mut acc = hasher.hash(leaves[leaf_index as usize].as_ref());
    let mut index = leaf_index;

    for level in 0..height {
        let size = level_size(leaf_count, level);
        let sibling = sibling_index(index);
        let digest = if sibling < size {
            node_digest(hasher, leaves, leaf_count, level, sibling, cache)?
        } else {
            // Duplication padding: the sibling is the path node itself,
            // whose digest we already carry.
            acc.clone()
        };

        let on_right = sibling_is_right(index);
        acc = if on_right {
            combine(hasher, &acc, &digest)
        } else {
            combine(hasher, &digest, &acc)
        };
        steps.push(ProofStep {
            sibling: digest,
            sibling_on_right: on_right,
        });
        index /= 2;
    }

    Ok(Proof {
        leaf: leaves[leaf_index as usize].as_ref().to_vec(),
        leaf_index,
        tree_height: height,
        steps,
    })
}

/// Digest of node (`level`, `index`), from the cache when possible,
/// otherwise recomputed from the leaf window beneath it.
fn node_digest<H, L>(
    hasher: &H,
    leaves: &[L],
    leaf_count: u64,
    level: u32,
    index: u64,
    cache: Option<&LevelCache>,
) -> Result<Digest, TreeError>
where
    H: MerkleHash + ?Sized,
    L: AsRef<[u8]>,
{
    if let Some(cache) = cache.filter(|c| c.band().contains(level)) {
        if let Some(digest) = cache.lookup(level, index) {
            return Ok(digest);
        }
    }

    let digest = if level == 0 {
        hasher.hash(leaves[index as usize].as_ref())
    } else {
        let child_level = level - 1;
        let child_size = level_size(leaf_count, child_level);
        let left_index = index * 2;
        let left = node_digest(hasher, leaves, leaf_count, child_level, left_index, cache)?;
        if left_index + 1 < child_size {
            let right = node_digest(
                hasher,
                leaves,
                leaf_count,
                child_level,
                left_index + 1,
                cache,
            )?;
            combine(hasher, &left, &right)
        } else {
            combine(hasher, &left, &left)
        }
    };

    if let Some(cache) = cache.filter(|c| c.band().contains(level)) {
        cache.insert(level, index, digest.clone())?;
    }
    Ok(digest)
}
