//! Hash abstraction and the bundled digest algorithms.
//!
//! Every tree, proof, and cache in this crate is parameterized by a
//! [`MerkleHash`] implementation. SHA-256, SHA-512, and BLAKE3 are bundled;
//! anything implementing the trait works, including digests of widths the
//! bundled algorithms don't use.

use sha2::{Digest as _, Sha256, Sha512};

/// A digest produced by a [`MerkleHash`].
///
/// Width is fixed per algorithm but varies between algorithms, so digests
/// are heap-allocated rather than fixed arrays.
pub type Digest = Vec<u8>;

/// Convert a digest to a lowercase hex string.
pub fn to_hex(digest: &[u8]) -> String {
    hex::encode(digest)
}

/// Parse a hex string into a digest.
pub fn from_hex(s: &str) -> Result<Digest, hex::FromHexError> {
    hex::decode(s)
}

/// Compare two digests for equality.
pub fn digest_equals(a: &[u8], b: &[u8]) -> bool {
    a == b
}

/// A named hash algorithm with a fixed digest width.
///
/// Implementations must be pure: the same input always produces the same
/// digest, and `hash` returns exactly `digest_size` bytes. The name is
/// compared byte-for-byte when a persisted cache is attached to a leaf set,
/// so implementors should treat it as part of their wire contract.
pub trait MerkleHash: Send + Sync {
    /// Algorithm identifier, e.g. `"SHA-256"`.
    fn name(&self) -> &str;

    /// Digest width in bytes.
    fn digest_size(&self) -> usize;

    /// Hash a contiguous byte slice.
    fn hash(&self, data: &[u8]) -> Digest;
}

/// Parent combiner: the hash of the two child digests concatenated.
///
/// No length prefix, tag byte, or domain separation is applied. The root is
/// observable on disk, so other implementations must be able to reproduce
/// this exact construction.
pub fn combine<H: MerkleHash + ?Sized>(hasher: &H, left: &[u8], right: &[u8]) -> Digest {
    let mut buf = Vec::with_capacity(left.len() + right.len());
    buf.extend_from_slice(left);
    buf.extend_from_slice(right);
    hasher.hash(&buf)
}

/// SHA-256, 32-byte digests.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl MerkleHash for Sha256Hasher {
    fn name(&self) -> &str {
        "SHA-256"
    }

    fn digest_size(&self) -> usize {
        32
    }

    fn hash(&self, data: &[u8]) -> Digest {
        Sha256::digest(data).to_vec()
    }
}

/// SHA-512, 64-byte digests.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha512Hasher;

impl MerkleHash for Sha512Hasher {
    fn name(&self) -> &str {
        "SHA-512"
    }

    fn digest_size(&self) -> usize {
        64
    }

    fn hash(&self, data: &[u8]) -> Digest {
        Sha512::digest(data).to_vec()
    }
}

/// BLAKE3, 32-byte digests.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Hasher;

impl MerkleHash for Blake3Hasher {
    fn name(&self) -> &str {
        "BLAKE3"
    }

    fn digest_size(&self) -> usize {
        32
    }

    fn hash(&self, data: &[u8]) -> Digest {
        blake3::hash(data).as_bytes().to_vec()
    }
}
