//! Merkle layers, bottom-up reduction and the proof locator
//!
//! `layers[0]` holds the `2^height` leaves and `layers[height]` holds the
//! single root. There is no padding: a leaf count that is not a power of two
//! is rejected.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::hash_pair;
use crate::types::Hash32;

/// Magic bytes at the start of a persisted layer blob
pub const LAYERS_MAGIC: [u8; 4] = *b"KLYR";

/// Layer blob format version
pub const LAYERS_VERSION: u8 = 1;

/// Largest supported tree height
pub const MAX_HEIGHT: u8 = 32;

/// Size of the blob header: magic, version, height
const HEADER_LEN: usize = 6;

/// Nodes hashed between progress callbacks during reduction
const REDUCE_PROGRESS_CHUNK: u64 = 4096;

/// Which side of the path node its sibling sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Sibling is the left operand: `H(sibling || node)`
    Left,
    /// Sibling is the right operand: `H(node || sibling)`
    Right,
}

/// Authentication path for one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Slot index of the leaf
    pub index: u64,
    /// Sibling hash at each level, bottom-up (length = height)
    pub neighbors: Vec<Hash32>,
    /// Side of each sibling
    pub sides: Vec<Side>,
}

impl MerkleProof {
    /// Fold the path over `leaf`
    pub fn compute_root(&self, leaf: &Hash32) -> Hash32 {
        self.neighbors
            .iter()
            .zip(&self.sides)
            .fold(*leaf, |node, (sibling, side)| match side {
                Side::Left => hash_pair(sibling, &node),
                Side::Right => hash_pair(&node, sibling),
            })
    }

    pub fn verify(&self, root: &Hash32, leaf: &Hash32) -> bool {
        self.compute_root(leaf) == *root
    }
}

/// Verify a path the way the contract does, taking sides from the index bits
pub fn verify_proof(root: &Hash32, leaf: &Hash32, index: u64, neighbors: &[Hash32]) -> bool {
    if neighbors.len() > MAX_HEIGHT as usize || index >> neighbors.len() != 0 {
        return false;
    }
    let mut node = *leaf;
    let mut idx = index;
    for sibling in neighbors {
        node = if idx & 1 == 0 {
            hash_pair(&node, sibling)
        } else {
            hash_pair(sibling, &node)
        };
        idx >>= 1;
    }
    node == *root
}

/// All levels of a complete binary Merkle tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<Hash32>>", into = "Vec<Vec<Hash32>>")]
pub struct Layers {
    layers: Vec<Vec<Hash32>>,
}

impl Layers {
    /// Wrap precomputed layers after checking their shape
    pub fn from_layers(layers: Vec<Vec<Hash32>>) -> Result<Self> {
        let height = layers
            .len()
            .checked_sub(1)
            .ok_or_else(|| Error::LayerFormat("no layers".to_string()))?;
        if height > MAX_HEIGHT as usize {
            return Err(Error::LayerFormat(format!("height {} too large", height)));
        }
        for (level, layer) in layers.iter().enumerate() {
            let expected = 1usize << (height - level);
            if layer.len() != expected {
                return Err(Error::LayerFormat(format!(
                    "layer {} has {} nodes, expected {}",
                    level,
                    layer.len(),
                    expected
                )));
            }
        }
        Ok(Self { layers })
    }

    /// Reduce leaves into layers without progress reporting
    pub fn build(leaves: Vec<Hash32>) -> Result<Self> {
        reduce(leaves, |_, _| Ok(()))
    }

    pub fn height(&self) -> u8 {
        (self.layers.len() - 1) as u8
    }

    pub fn root(&self) -> Hash32 {
        self.layers[self.layers.len() - 1][0]
    }

    pub fn slot_count(&self) -> u64 {
        self.layers[0].len() as u64
    }

    pub fn leaves(&self) -> &[Hash32] {
        &self.layers[0]
    }

    pub fn layer(&self, level: usize) -> Option<&[Hash32]> {
        self.layers.get(level).map(Vec::as_slice)
    }

    /// Leaf at `index`, bounds-checked
    pub fn leaf(&self, index: u64) -> Result<Hash32> {
        self.check_index(index)?;
        Ok(self.layers[0][index as usize])
    }

    fn check_index(&self, index: u64) -> Result<()> {
        if index >= self.slot_count() {
            return Err(Error::SlotOutOfRange {
                index,
                slots: self.slot_count(),
            });
        }
        Ok(())
    }

    /// Locate the authentication path for `index`
    ///
    /// At each level the sibling is `idx ^ 1`; the index halves going up.
    pub fn proof(&self, index: u64) -> Result<MerkleProof> {
        self.check_index(index)?;

        let height = self.height() as usize;
        let mut neighbors = Vec::with_capacity(height);
        let mut sides = Vec::with_capacity(height);
        let mut idx = index as usize;

        for layer in &self.layers[..height] {
            let sibling = idx ^ 1;
            neighbors.push(layer[sibling]);
            sides.push(if sibling < idx { Side::Left } else { Side::Right });
            idx >>= 1;
        }

        Ok(MerkleProof {
            index,
            neighbors,
            sides,
        })
    }

    /// Serialize to the persisted blob format
    pub fn to_bytes(&self) -> Vec<u8> {
        let nodes: usize = self.layers.iter().map(Vec::len).sum();
        let mut bytes = Vec::with_capacity(HEADER_LEN + nodes * 32);
        bytes.extend_from_slice(&LAYERS_MAGIC);
        bytes.push(LAYERS_VERSION);
        bytes.push(self.height());
        for layer in &self.layers {
            for node in layer {
                bytes.extend_from_slice(&node.0);
            }
        }
        bytes
    }

    /// Deserialize from the persisted blob format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::LayerFormat("blob too short".to_string()));
        }
        if bytes[0..4] != LAYERS_MAGIC {
            return Err(Error::LayerFormat("bad magic".to_string()));
        }
        if bytes[4] != LAYERS_VERSION {
            return Err(Error::LayerFormat(format!("unsupported version {}", bytes[4])));
        }
        let height = bytes[5];
        if height > MAX_HEIGHT {
            return Err(Error::LayerFormat(format!("height {} too large", height)));
        }

        let node_count = (1usize << (height as usize + 1)) - 1;
        let body = &bytes[HEADER_LEN..];
        if body.len() != node_count * 32 {
            return Err(Error::LayerFormat(format!(
                "expected {} bytes of nodes, got {}",
                node_count * 32,
                body.len()
            )));
        }

        let mut chunks = body.chunks_exact(32);
        let mut layers = Vec::with_capacity(height as usize + 1);
        for level in 0..=height as usize {
            let width = 1usize << (height as usize - level);
            let layer = chunks
                .by_ref()
                .take(width)
                .map(|chunk| {
                    let mut node = [0u8; 32];
                    node.copy_from_slice(chunk);
                    Hash32(node)
                })
                .collect();
            layers.push(layer);
        }

        Self::from_layers(layers)
    }
}

impl TryFrom<Vec<Vec<Hash32>>> for Layers {
    type Error = Error;

    fn try_from(layers: Vec<Vec<Hash32>>) -> Result<Self> {
        Self::from_layers(layers)
    }
}

impl From<Layers> for Vec<Vec<Hash32>> {
    fn from(layers: Layers) -> Self {
        layers.layers
    }
}

/// Reduce `2^height` leaves into layers
///
/// `progress(done, total)` is called as interior nodes are hashed; an error
/// returned from it aborts the reduction.
pub fn reduce<F>(leaves: Vec<Hash32>, mut progress: F) -> Result<Layers>
where
    F: FnMut(u64, u64) -> Result<()>,
{
    let count = leaves.len();
    if count == 0 || !count.is_power_of_two() {
        return Err(Error::InvalidTreeParams(format!(
            "leaf count {} is not a power of two",
            count
        )));
    }
    let height = count.trailing_zeros() as usize;
    if height > MAX_HEIGHT as usize {
        return Err(Error::InvalidTreeParams(format!("height {} too large", height)));
    }

    let total = (count - 1) as u64;
    let mut done = 0u64;
    let mut layers = Vec::with_capacity(height + 1);
    layers.push(leaves);

    for level in 0..height {
        let below = &layers[level];
        let mut next = Vec::with_capacity(below.len() / 2);
        for pair in below.chunks_exact(2) {
            next.push(hash_pair(&pair[0], &pair[1]));
            done += 1;
            if done % REDUCE_PROGRESS_CHUNK == 0 {
                progress(done, total)?;
            }
        }
        layers.push(next);
    }
    progress(total, total)?;

    Ok(Layers { layers })
}
