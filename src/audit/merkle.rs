//! Merkle Tree for Audit Logs
//!
//! Builds the tree that summarizes the whole audit log into one root digest.
//! Levels are reduced pairwise, left to right. When a level has an odd number
//! of nodes the last node is paired with itself, never promoted.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audit::digest::{combine, digest};
use crate::error::{AuditError, Result};

/// Separator between child contents in a parent's provenance string.
const CONTENT_SEPARATOR: &str = " | ";

/// Merkle tree node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub left: Option<Box<Node>>,
    pub right: Option<Box<Node>>,
    /// Hex digest of this node.
    pub value: String,
    /// Human-readable provenance. Never used for integrity decisions.
    pub content: String,
    pub is_leaf: bool,
}

impl Node {
    /// Create a leaf node from one serialized entry
    pub fn leaf(content: impl AsRef<[u8]>) -> Self {
        let bytes = content.as_ref();
        Self {
            left: None,
            right: None,
            value: digest(bytes),
            content: String::from_utf8_lossy(bytes).into_owned(),
            is_leaf: true,
        }
    }

    /// Create an internal node from two children
    pub fn parent(left: Node, right: Node) -> Self {
        let value = combine(&left.value, &right.value);
        let content = format!("{}{}{}", left.content, CONTENT_SEPARATOR, right.content);

        Self {
            left: Some(Box::new(left)),
            right: Some(Box::new(right)),
            value,
            content,
            is_leaf: false,
        }
    }

    /// Create the parent of an unpaired last node by pairing it with itself
    pub fn duplicated(child: Node) -> Self {
        Self::parent(child.clone(), child)
    }
}

/// Build a Merkle tree over the ordered leaf contents.
pub fn build_merkle_tree<T: AsRef<[u8]>>(leaves: &[T]) -> Result<Node> {
    if leaves.is_empty() {
        return Err(AuditError::EmptyInput);
    }

    let mut nodes: VecDeque<Node> = leaves.iter().map(Node::leaf).collect();

    while nodes.len() > 1 {
        let mut next_level = VecDeque::with_capacity(nodes.len().div_ceil(2));

        while let Some(left) = nodes.pop_front() {
            match nodes.pop_front() {
                Some(right) => next_level.push_back(Node::parent(left, right)),
                None => next_level.push_back(Node::duplicated(left)),
            }
        }

        nodes = next_level;
    }

    let root = nodes.pop_front().ok_or(AuditError::EmptyInput)?;
    debug!("Merkle tree root over {} leaves: {}", leaves.len(), root.value);
    Ok(root)
}

/// Root digest only.
///
/// Same reduction as [`build_merkle_tree`] without materializing nodes or
/// provenance strings, which grow with the whole log.
pub fn merkle_root<T: AsRef<[u8]>>(leaves: &[T]) -> Result<String> {
    let mut level: Vec<String> = leaves.iter().map(digest).collect();
    if level.is_empty() {
        return Err(AuditError::EmptyInput);
    }

    while level.len() > 1 {
        level = next_level(&level);
    }

    level.pop().ok_or(AuditError::EmptyInput)
}

fn next_level(level: &[String]) -> Vec<String> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => combine(left, right),
            [single] => combine(single, single),
            _ => unreachable!("chunks(2) yields one or two items"),
        })
        .collect()
}

/// Side on which a sibling sits relative to the running hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// One step of an inclusion proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: String,
    pub side: Side,
}

/// Merkle inclusion proof for a single leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub leaf_hash: String,
    pub steps: Vec<ProofStep>,
    pub root_hash: String,
}

impl MerkleProof {
    /// Recompute the root from the leaf and compare with `root_hash`.
    pub fn verify(&self) -> bool {
        self.computed_root() == self.root_hash
    }

    /// Check that `content` is the leaf this proof covers and that it
    /// leads to `root`.
    pub fn verify_content(&self, content: impl AsRef<[u8]>, root: &str) -> bool {
        digest(content) == self.leaf_hash && self.computed_root() == root
    }

    fn computed_root(&self) -> String {
        self.steps
            .iter()
            .fold(self.leaf_hash.clone(), |current, step| match step.side {
                Side::Left => combine(&step.sibling, &current),
                Side::Right => combine(&current, &step.sibling),
            })
    }

    /// Number of sibling hashes, which is the height of the tree.
    pub fn size(&self) -> usize {
        self.steps.len()
    }

    pub fn summary(&self) -> String {
        format!(
            "Merkle proof for entry {}: {} hashes, root: {}",
            self.leaf_index,
            self.size(),
            self.root_hash
        )
    }
}

/// Generate an inclusion proof for the leaf at `index`
pub fn generate_proof<T: AsRef<[u8]>>(leaves: &[T], index: usize) -> Result<MerkleProof> {
    if leaves.is_empty() {
        return Err(AuditError::EmptyInput);
    }
    if index >= leaves.len() {
        return Err(AuditError::IndexOutOfRange {
            index,
            len: leaves.len(),
        });
    }

    let mut level: Vec<String> = leaves.iter().map(digest).collect();
    let leaf_hash = level[index].clone();
    let mut position = index;
    let mut steps = Vec::new();

    while level.len() > 1 {
        let step = if position % 2 == 0 {
            // Unpaired last node is its own sibling
            let sibling = level.get(position + 1).unwrap_or(&level[position]);
            ProofStep {
                sibling: sibling.clone(),
                side: Side::Right,
            }
        } else {
            ProofStep {
                sibling: level[position - 1].clone(),
                side: Side::Left,
            }
        };
        steps.push(step);

        level = next_level(&level);
        position /= 2;
    }

    Ok(MerkleProof {
        leaf_index: index,
        leaf_hash,
        steps,
        root_hash: level.swap_remove(0),
    })
}
