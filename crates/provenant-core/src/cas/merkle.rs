//! Merkle tree over named blobs.
//!
//! Leaves are `(name, digest)` pairs sorted by name, so the root is a pure
//! function of the leaf set. Leaf and interior hashes are domain-separated
//! (`0x00` / `0x01` prefix); an odd node at the end of a level is paired with itself.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{invalid_input, Result};
use crate::hasher::{digest_parts, Digest};

const LEAF_PREFIX: &[u8] = &[0x00];
const NODE_PREFIX: &[u8] = &[0x01];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleLeaf {
    pub name: String,
    pub digest: Digest,
}

/// Which side the sibling sits on when recombining.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: Digest,
    pub side: Side,
    pub level: usize,
}

/// Membership proof for one leaf
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub index: usize,
    pub steps: Vec<ProofStep>,
}

impl MerkleProof {
    /// Recompute the root from `(name, digest)` and this proof and compare against `root`.
    pub fn verify(&self, name: &str, digest: &Digest, root: &Digest) -> bool {
        let mut current = leaf_hash(name, digest);
        for step in &self.steps {
            current = match step.side {
                Side::Left => node_hash(&step.hash, &current),
                Side::Right => node_hash(&current, &step.hash),
            };
        }
        current == *root
    }
}

#[derive(Clone, Debug)]
pub struct MerkleTree {
    leaves: Vec<MerkleLeaf>,
    /// levels[0] = leaf hashes, last = [root]
    levels: Vec<Vec<Digest>>,
}

pub fn leaf_hash(name: &str, digest: &Digest) -> Digest {
    digest_parts(&[LEAF_PREFIX, name.as_bytes(), &[0x00], digest.as_bytes()])
}

fn node_hash(left: &Digest, right: &Digest) -> Digest {
    digest_parts(&[NODE_PREFIX, left.as_bytes(), right.as_bytes()])
}

impl MerkleTree {
    /// Build from any ordering of leaves. Exact duplicates collapse; a name bound to two
    /// different digests is rejected.
    pub fn build(mut leaves: Vec<(String, Digest)>) -> Result<Self> {
        leaves.sort();
        leaves.dedup();
        let mut seen: HashMap<&str, &Digest> = HashMap::new();
        for (name, d) in &leaves {
            if let Some(prev) = seen.insert(name.as_str(), d) {
                return Err(invalid_input(
                    "build_merkle",
                    format!("leaf {:?} has two digests ({} and {})", name, prev, d),
                ));
            }
        }

        let leaves: Vec<MerkleLeaf> = leaves
            .into_iter()
            .map(|(name, digest)| MerkleLeaf { name, digest })
            .collect();

        let mut levels = Vec::new();
        if !leaves.is_empty() {
            let mut level: Vec<Digest> = leaves.iter().map(|l| leaf_hash(&l.name, &l.digest)).collect();
            while level.len() > 1 {
                let next = level
                    .chunks(2)
                    .map(|pair| match pair {
                        [l, r] => node_hash(l, r),
                        [only] => node_hash(only, only),
                        _ => unreachable!("chunks(2) yields one or two items"),
                    })
                    .collect();
                levels.push(level);
                level = next;
            }
            levels.push(level);
        }
        Ok(Self { leaves, levels })
    }

    pub fn root(&self) -> Digest {
        self.levels
            .last()
            .and_then(|top| top.first())
            .copied()
            .unwrap_or(Digest::ZERO)
    }

    /// Leaves in canonical (sorted) order
    pub fn leaves(&self) -> &[MerkleLeaf] {
        &self.leaves
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.leaves.iter().position(|l| l.name == name)
    }

    /// Proof for the leaf at `index` in canonical order
    pub fn proof(&self, index: usize) -> Result<MerkleProof> {
        if index >= self.leaves.len() {
            return Err(invalid_input(
                "merkle_proof",
                format!("index {} out of range for {} leaves", index, self.leaves.len()),
            ));
        }
        let mut steps = Vec::new();
        let mut idx = index;
        for (level_no, level) in self.levels.iter().enumerate() {
            if level.len() == 1 {
                break;
            }
            let (sibling, side) = if idx % 2 == 0 {
                (level.get(idx + 1).unwrap_or(&level[idx]), Side::Right)
            } else {
                (&level[idx - 1], Side::Left)
            };
            steps.push(ProofStep { hash: *sibling, side, level: level_no });
            idx /= 2;
        }
        Ok(MerkleProof { index, steps })
    }
}
