//! Content-addressed storage and Merkle trees over stored blobs.

mod merkle;
mod store;

pub use merkle::{leaf_hash, MerkleLeaf, MerkleProof, MerkleTree, ProofStep, Side};
pub use store::{CasStats, ContentAddressableStore};
