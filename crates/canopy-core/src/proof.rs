//! Membership proofs: generation output, wire format, and verification.
//!
//! A proof carries the leaf payload, its index, the tree height, and one
//! sibling digest per level with an orientation bit. Verification folds the
//! leaf digest up through the siblings and compares the result with an
//! expected root; it is pure and stateless.

use crate::hash::{combine, Digest, MerkleHash};
use crate::wire::ByteReader;

/// Wire magic for serialized proofs.
pub const PROOF_MAGIC: &[u8; 4] = b"MPRF";

/// Current proof wire-format version.
pub const PROOF_VERSION: u8 = 1;

/// One level of a proof path: the sibling digest and which side it sits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofStep {
    /// Digest of the sibling node at this level. When the path node had no
    /// natural sibling, this is the path node's own digest (duplication
    /// padding).
    pub sibling: Digest,
    /// True when the sibling is the right-hand input to the parent hash.
    pub sibling_on_right: bool,
}

/// A self-describing membership proof.
///
/// `steps.len()` always equals `tree_height`; a single-leaf tree yields an
/// empty path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    /// The leaf payload being proven.
    pub leaf: Vec<u8>,
    /// Position of the leaf in the original sequence.
    pub leaf_index: u64,
    /// Height of the tree the proof was extracted from.
    pub tree_height: u32,
    /// Sibling path from the leaf level up to (but excluding) the root.
    pub steps: Vec<ProofStep>,
}

/// Proof wire-format errors.
#[derive(Debug, thiserror::Error)]
pub enum ProofError {
    #[error("bad proof magic")]
    BadMagic,
    #[error("unsupported proof version {0}")]
    UnsupportedVersion(u8),
    #[error("proof truncated reading {0}")]
    Truncated(&'static str),
    #[error("sibling count {count} does not match tree height {height}")]
    SiblingCountMismatch { count: u32, height: u32 },
    #[error("{0} trailing bytes after proof")]
    TrailingBytes(usize),
}

impl Proof {
    /// Serialize to the versioned little-endian wire format.
    pub fn encode(&self) -> Vec<u8> {
        let sibling_bytes: usize = self.steps.iter().map(|s| 5 + s.sibling.len()).sum();
        let mut out = Vec::with_capacity(4 + 1 + 8 + 4 + 4 + self.leaf.len() + 4 + sibling_bytes);

        out.extend_from_slice(PROOF_MAGIC);
        out.push(PROOF_VERSION);
        out.extend_from_slice(&self.leaf_index.to_le_bytes());
        out.extend_from_slice(&self.tree_height.to_le_bytes());
        out.extend_from_slice(&(self.leaf.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.leaf);
        out.extend_from_slice(&(self.steps.len() as u32).to_le_bytes());
        for step in &self.steps {
            out.extend_from_slice(&(step.sibling.len() as u32).to_le_bytes());
            out.extend_from_slice(&step.sibling);
            out.push(u8::from(step.sibling_on_right));
        }
        out
    }

    /// Parse the wire format, validating magic, version, and that the
    /// sibling count equals the recorded tree height.
    pub fn decode(data: &[u8]) -> Result<Self, ProofError> {
        let mut r = ByteReader::new(data);

        let magic = r.take(4).ok_or(ProofError::Truncated("magic"))?;
        if magic != PROOF_MAGIC {
            return Err(ProofError::BadMagic);
        }
        let version = r.u8().ok_or(ProofError::Truncated("version"))?;
        if version != PROOF_VERSION {
            return Err(ProofError::UnsupportedVersion(version));
        }

        let leaf_index = r.u64_le().ok_or(ProofError::Truncated("leaf index"))?;
        let tree_height = r.u32_le().ok_or(ProofError::Truncated("tree height"))?;
        let leaf_len = r.u32_le().ok_or(ProofError::Truncated("leaf length"))?;
        let leaf = r
            .take(leaf_len as usize)
            .ok_or(ProofError::Truncated("leaf bytes"))?
            .to_vec();

        let sibling_count = r.u32_le().ok_or(ProofError::Truncated("sibling count"))?;
        if sibling_count != tree_height {
            return Err(ProofError::SiblingCountMismatch {
                count: sibling_count,
                height: tree_height,
            });
        }

        let mut steps = Vec::with_capacity(sibling_count as usize);
        for _ in 0..sibling_count {
            let len = r.u32_le().ok_or(ProofError::Truncated("sibling length"))?;
            let sibling = r
                .take(len as usize)
                .ok_or(ProofError::Truncated("sibling bytes"))?
                .to_vec();
            let orientation = r.u8().ok_or(ProofError::Truncated("orientation"))?;
            steps.push(ProofStep {
                sibling,
                sibling_on_right: orientation == 1,
            });
        }

        if !r.is_empty() {
            return Err(ProofError::TrailingBytes(r.remaining()));
        }

        Ok(Proof {
            leaf,
            leaf_index,
            tree_height,
            steps,
        })
    }
}

/// Recompute the root from `proof` and compare it with `expected_root`.
///
/// Pure and idempotent: calling it any number of times with the same
/// arguments returns the same boolean and mutates nothing.
pub fn verify<H: MerkleHash + ?Sized>(proof: &Proof, expected_root: &[u8], hasher: &H) -> bool {
    let mut acc = hasher.hash(&proof.leaf);
    for step in &proof.steps {
        acc = if step.sibling_on_right {
            combine(hasher, &acc, &step.sibling)
        } else {
            combine(hasher, &step.sibling, &acc)
        };
    }
    acc == expected_root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Sha256Hasher;

    fn sample_proof() -> Proof {
        let h = Sha256Hasher;
        Proof {
            leaf: b"leaf payload".to_vec(),
            leaf_index: 5,
            tree_height: 2,
            steps: vec![
                ProofStep {
                    sibling: h.hash(b"sib0"),
                    sibling_on_right: false,
                },
                ProofStep {
                    sibling: h.hash(b"sib1"),
                    sibling_on_right: true,
                },
            ],
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let proof = sample_proof();
        let decoded = Proof::decode(&proof.encode()).unwrap();
        assert_eq!(decoded, proof);
    }

    #[test]
    fn test_encode_layout_prefix() {
        let proof = sample_proof();
        let bytes = proof.encode();
        assert_eq!(&bytes[..4], PROOF_MAGIC);
        assert_eq!(bytes[4], PROOF_VERSION);
        assert_eq!(u64::from_le_bytes(bytes[5..13].try_into().unwrap()), 5);
        assert_eq!(u32::from_le_bytes(bytes[13..17].try_into().unwrap()), 2);
    }

    #[test]
    fn test_empty_path_roundtrip() {
        let proof = Proof {
            leaf: b"only".to_vec(),
            leaf_index: 0,
            tree_height: 0,
            steps: vec![],
        };
        let decoded = Proof::decode(&proof.encode()).unwrap();
        assert_eq!(decoded, proof);
    }

    #[test]
    fn test_decode_bad_magic() {
        let mut bytes = sample_proof().encode();
        bytes[0] = b'X';
        assert!(matches!(Proof::decode(&bytes), Err(ProofError::BadMagic)));
    }

    #[test]
    fn test_decode_bad_version() {
        let mut bytes = sample_proof().encode();
        bytes[4] = 9;
        assert!(matches!(
            Proof::decode(&bytes),
            Err(ProofError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_decode_sibling_count_mismatch() {
        let mut proof = sample_proof();
        proof.tree_height = 3;
        assert!(matches!(
            Proof::decode(&proof.encode()),
            Err(ProofError::SiblingCountMismatch { count: 2, height: 3 })
        ));
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = sample_proof().encode();
        for cut in [0, 3, 4, 12, 20, bytes.len() - 1] {
            assert!(
                matches!(
                    Proof::decode(&bytes[..cut]),
                    Err(ProofError::BadMagic | ProofError::Truncated(_))
                ),
                "cut = {cut}"
            );
        }
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut bytes = sample_proof().encode();
        bytes.push(0);
        assert!(matches!(
            Proof::decode(&bytes),
            Err(ProofError::TrailingBytes(_))
        ));
    }

    #[test]
    fn test_verify_two_leaves_by_hand() {
        let h = Sha256Hasher;
        let left = h.hash(b"a");
        let right = h.hash(b"b");
        let root = combine(&h, &left, &right);

        let proof = Proof {
            leaf: b"a".to_vec(),
            leaf_index: 0,
            tree_height: 1,
            steps: vec![ProofStep {
                sibling: right,
                sibling_on_right: true,
            }],
        };
        assert!(verify(&proof, &root, &h));
        assert!(!verify(&proof, &left, &h));
    }

    #[test]
    fn test_verify_is_idempotent() {
        let h = Sha256Hasher;
        let root = h.hash(b"single leaf");
        let proof = Proof {
            leaf: b"single leaf".to_vec(),
            leaf_index: 0,
            tree_height: 0,
            steps: vec![],
        };
        for _ in 0..3 {
            assert!(verify(&proof, &root, &h));
        }
    }

    #[test]
    fn test_verify_rejects_wrong_leaf() {
        let h = Sha256Hasher;
        let root = h.hash(b"real");
        let proof = Proof {
            leaf: b"forged".to_vec(),
            leaf_index: 0,
            tree_height: 0,
            steps: vec![],
        };
        assert!(!verify(&proof, &root, &h));
    }
}
