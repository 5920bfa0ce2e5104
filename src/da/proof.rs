use ethers::abi::{self, Token};
use ethers::types::{Bytes, H256, U256};
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{Error, Result};
use crate::types::{DaPointer, ElementIndex};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// One level of a Merkle path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleStep {
    pub sibling: H256,
    /// Sibling sits to the left of the running hash.
    pub left: bool,
}

/// Inclusion proof binding one element of a bundle blob to its DA location.
///
/// `path` proves `leaf` against the root of the bundle's element tree;
/// `share_proof` is the DA network's own proof that the blob sits at
/// `pointer`, kept opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaProof {
    pub pointer: DaPointer,
    pub element: ElementIndex,
    pub leaf: H256,
    pub root: H256,
    pub path: Vec<MerkleStep>,
    pub share_proof: serde_json::Value,
}

impl DaProof {
    /// Checks that the proof is about `pointer`, that it commits to `root`
    /// (the element root of the blob actually stored there), and that its
    /// path is sound.
    pub fn verify(&self, pointer: &DaPointer, root: H256) -> Result<()> {
        if &self.pointer != pointer {
            return Err(Error::InvalidProof(format!(
                "proof is for {:?}, expected {:?}",
                self.pointer, pointer
            )));
        }
        if self.root != root {
            return Err(Error::InvalidProof(format!(
                "proof root {:?} does not match blob root {root:?}",
                self.root
            )));
        }
        if root_from_path(self.leaf, &self.path) != self.root {
            return Err(Error::InvalidProof("merkle path does not reach root".into()));
        }
        Ok(())
    }

    /// ABI payload passed to the on-chain defense entry point.
    pub fn encode(&self) -> Result<Bytes> {
        let sides = self
            .path
            .iter()
            .enumerate()
            .filter(|(_, step)| step.left)
            .fold(U256::zero(), |acc, (i, _)| acc | (U256::one() << i));
        let share_proof = serde_json::to_vec(&self.share_proof)
            .map_err(|e| Error::InvalidProof(format!("share proof: {e}")))?;

        Ok(abi::encode(&[
            Token::FixedBytes(self.pointer.namespace.as_bytes().to_vec()),
            Token::Uint(self.pointer.height.into()),
            Token::FixedBytes(self.pointer.commitment.as_bytes().to_vec()),
            Token::FixedBytes(self.root.as_bytes().to_vec()),
            Token::Array(
                self.path
                    .iter()
                    .map(|step| Token::FixedBytes(step.sibling.as_bytes().to_vec()))
                    .collect(),
            ),
            Token::Uint(sides),
            Token::Bytes(share_proof),
        ])
        .into())
    }
}

fn hash_leaf(leaf: H256) -> H256 {
    let mut buf = [0u8; 33];
    buf[0] = LEAF_PREFIX;
    buf[1..].copy_from_slice(leaf.as_bytes());
    codec::hash_bytes(&buf)
}

fn hash_node(left: H256, right: H256) -> H256 {
    let mut buf = [0u8; 65];
    buf[0] = NODE_PREFIX;
    buf[1..33].copy_from_slice(left.as_bytes());
    buf[33..].copy_from_slice(right.as_bytes());
    codec::hash_bytes(&buf)
}

/// Builds the next level up; an unpaired last node is carried as is.
fn next_level(level: &[H256]) -> Vec<H256> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => hash_node(*left, *right),
            [single] => *single,
            _ => unreachable!("chunks(2) yields one or two nodes"),
        })
        .collect()
}

pub fn merkle_root(leaves: &[H256]) -> H256 {
    if leaves.is_empty() {
        return H256::zero();
    }
    let mut level: Vec<H256> = leaves.iter().copied().map(hash_leaf).collect();
    while level.len() > 1 {
        level = next_level(&level);
    }
    level[0]
}

pub fn merkle_path(leaves: &[H256], index: usize) -> Option<Vec<MerkleStep>> {
    if index >= leaves.len() {
        return None;
    }

    let mut path = Vec::new();
    let mut level: Vec<H256> = leaves.iter().copied().map(hash_leaf).collect();
    let mut idx = index;
    while level.len() > 1 {
        if idx % 2 == 1 {
            path.push(MerkleStep {
                sibling: level[idx - 1],
                left: true,
            });
        } else if idx + 1 < level.len() {
            path.push(MerkleStep {
                sibling: level[idx + 1],
                left: false,
            });
        }
        level = next_level(&level);
        idx /= 2;
    }
    Some(path)
}

pub fn root_from_path(leaf: H256, path: &[MerkleStep]) -> H256 {
    path.iter().fold(hash_leaf(leaf), |acc, step| {
        if step.left {
            hash_node(step.sibling, acc)
        } else {
            hash_node(acc, step.sibling)
        }
    })
}

/// Interprets `blob` as a bundle and proves `element` inside it.
pub fn build_element_proof(
    pointer: DaPointer,
    blob: &[u8],
    element: ElementIndex,
    share_proof: serde_json::Value,
) -> Result<DaProof> {
    let blocks = codec::decode_bundle_blob(blob)?;
    let elements = codec::bundle_elements(&blocks);
    let leaves: Vec<H256> = elements.iter().map(|(_, leaf)| *leaf).collect();

    let position = elements
        .iter()
        .position(|(idx, _)| *idx == element)
        .ok_or_else(|| {
            Error::DaNotFound(format!("element {element:?} absent from blob at {pointer:?}"))
        })?;
    let path = merkle_path(&leaves, position)
        .ok_or_else(|| Error::DaNotFound(format!("element {element:?} out of range")))?;

    Ok(DaProof {
        pointer,
        element,
        leaf: leaves[position],
        root: merkle_root(&leaves),
        path,
        share_proof,
    })
}

/// Root of the element tree of a decoded bundle.
pub fn element_root(elements: &[(ElementIndex, H256)]) -> H256 {
    let leaves: Vec<H256> = elements.iter().map(|(_, leaf)| *leaf).collect();
    merkle_root(&leaves)
}
