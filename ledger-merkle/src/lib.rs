//! Binary Merkle tree: odd levels duplicate the last node, proofs are a
//! sibling path of `{direction, hash}` from leaf to root, and an empty tree's
//! root is `SHA-256("")`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub type Hash = [u8; 32];

#[derive(Debug, Error)]
pub enum MerkleError {
    #[error("leaf index {0} out of bounds")]
    IndexOutOfBounds(usize),
}

pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

pub fn empty_root() -> Hash {
    Sha256::digest(b"").into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Left,
    Right,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofStep {
    pub direction: Direction,
    #[serde(with = "hex_hash")]
    pub hash: Hash,
}

mod hex_hash {
    use super::Hash;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Hash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32-byte hex hash"))
    }
}

/// A binary Merkle tree over already-hashed leaves. Levels are stored bottom
/// to top; a level with an odd node count duplicates its last node before
/// pairing, matching the reference tree's parity rule.
pub struct MerkleTree {
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    pub fn new(leaves: Vec<Hash>) -> Self {
        if leaves.is_empty() {
            return Self {
                levels: vec![vec![]],
            };
        }
        let mut levels = vec![leaves];
        while levels.last().unwrap().len() > 1 {
            let current = levels.last().unwrap();
            let mut next = Vec::with_capacity((current.len() + 1) / 2);
            let mut i = 0;
            while i < current.len() {
                let left = current[i];
                let right = if i + 1 < current.len() {
                    current[i + 1]
                } else {
                    current[i]
                };
                next.push(hash_pair(&left, &right));
                i += 2;
            }
            levels.push(next);
        }
        Self { levels }
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map(|l| l.len()).unwrap_or(0)
    }

    pub fn root(&self) -> Hash {
        match self.levels.last() {
            Some(top) if !top.is_empty() => top[0],
            _ => empty_root(),
        }
    }

    pub fn proof(&self, leaf_index: usize) -> Result<Vec<ProofStep>, MerkleError> {
        if leaf_index >= self.leaf_count() {
            return Err(MerkleError::IndexOutOfBounds(leaf_index));
        }
        let mut steps = Vec::new();
        let mut index = leaf_index;
        for level in &self.levels[..self.levels.len().saturating_sub(1)] {
            let is_right = index % 2 == 1;
            let sibling_index = if is_right { index - 1 } else { index + 1 };
            let sibling = if sibling_index < level.len() {
                level[sibling_index]
            } else {
                level[index]
            };
            steps.push(ProofStep {
                direction: if is_right {
                    Direction::Left
                } else {
                    Direction::Right
                },
                hash: sibling,
            });
            index /= 2;
        }
        Ok(steps)
    }
}

/// Replays `hash_pair` along `proof` starting from `leaf_hash` and compares
/// the result to `root`.
pub fn verify_proof(leaf_hash: &Hash, proof: &[ProofStep], root: &Hash) -> bool {
    let mut current = *leaf_hash;
    for step in proof {
        current = match step.direction {
            Direction::Left => hash_pair(&step.hash, &current),
            Direction::Right => hash_pair(&current, &step.hash),
        };
    }
    current == *root
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn leaf(bytes: &[u8]) -> Hash {
        Sha256::digest(bytes).into()
    }

    #[test]
    fn root_and_proofs_verify_for_three_leaves() {
        let leaves = vec![leaf(b"a"), leaf(b"b"), leaf(b"c")];
        let tree = MerkleTree::new(leaves.clone());
        let root = tree.root();
        for (i, l) in leaves.iter().enumerate() {
            let proof = tree.proof(i).unwrap();
            assert!(verify_proof(l, &proof, &root));
        }
    }

    #[test]
    fn tamper_detection() {
        let leaves: Vec<Hash> = (0u8..4).map(|i| leaf(&[i])).collect();
        let tree = MerkleTree::new(leaves.clone());
        let root = tree.root();
        let proof = tree.proof(0).unwrap();
        assert!(verify_proof(&leaves[0], &proof, &root));

        let bad_leaf = [0u8; 32];
        assert!(!verify_proof(&bad_leaf, &proof, &root));

        let mut bad_proof = proof.clone();
        bad_proof[0].hash = [0xffu8; 32];
        assert!(!verify_proof(&leaves[0], &bad_proof, &root));
    }

    #[test]
    fn single_leaf_root_is_leaf_hash() {
        let l = leaf(b"solo");
        let tree = MerkleTree::new(vec![l]);
        assert_eq!(tree.root(), l);
    }

    #[test]
    fn empty_tree_root_is_sha256_of_empty() {
        let tree = MerkleTree::new(vec![]);
        assert_eq!(tree.root(), empty_root());
    }

    proptest::proptest! {
        #[test]
        fn every_leaf_proof_verifies_against_the_root(
            leaves in proptest::collection::vec(proptest::collection::vec(proptest::prelude::any::<u8>(), 1..64), 1..40)
        ) {
            let hashes: Vec<Hash> = leaves.iter().map(|bytes| leaf(bytes)).collect();
            let tree = MerkleTree::new(hashes.clone());
            let root = tree.root();
            for (i, h) in hashes.iter().enumerate() {
                let proof = tree.proof(i).unwrap();
                proptest::prop_assert!(verify_proof(h, &proof, &root));
            }
        }
    }
}
