//! Merkle tree over transaction ids.
//!
//! Leaves are txids in block order. An internal node is
//! `SHA-256(SHA-256(left ‖ right))`; a layer with an odd count duplicates its
//! last node before pairing. An empty leaf set produces [`Hash256::ZERO`]
//! (never the case for valid blocks, which always carry a coinbase).

use crate::crypto;
use crate::types::Hash256;

/// Hash an internal node from its two children.
pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left.as_bytes());
    data[32..].copy_from_slice(right.as_bytes());
    crypto::sha256d(&data)
}

/// Compute the merkle root of a list of transaction ids.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return Hash256::ZERO;
    }

    let mut current = txids.to_vec();
    while current.len() > 1 {
        current = next_layer(&current);
    }
    current[0]
}

/// Pair up a layer, duplicating the last node when the count is odd.
fn next_layer(layer: &[Hash256]) -> Vec<Hash256> {
    let mut next = Vec::with_capacity(layer.len().div_ceil(2));
    let mut i = 0;
    while i < layer.len() {
        let left = &layer[i];
        let right = if i + 1 < layer.len() { &layer[i + 1] } else { left };
        next.push(node_hash(left, right));
        i += 2;
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(seed: u8) -> Hash256 {
        Hash256([seed; 32])
    }

    #[test]
    fn empty_is_zero() {
        assert_eq!(merkle_root(&[]), Hash256::ZERO);
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        assert_eq!(merkle_root(&[h(1)]), h(1));
    }

    #[test]
    fn two_leaves() {
        assert_eq!(merkle_root(&[h(1), h(2)]), node_hash(&h(1), &h(2)));
    }

    #[test]
    fn odd_count_duplicates_last() {
        // Three leaves: root = H(H(1,2), H(3,3)).
        let left = node_hash(&h(1), &h(2));
        let right = node_hash(&h(3), &h(3));
        assert_eq!(merkle_root(&[h(1), h(2), h(3)]), node_hash(&left, &right));
    }

    #[test]
    fn four_leaves() {
        let left = node_hash(&h(1), &h(2));
        let right = node_hash(&h(3), &h(4));
        assert_eq!(
            merkle_root(&[h(1), h(2), h(3), h(4)]),
            node_hash(&left, &right),
        );
    }

    #[test]
    fn order_matters() {
        assert_ne!(merkle_root(&[h(1), h(2)]), merkle_root(&[h(2), h(1)]));
    }

    #[test]
    fn deterministic() {
        let leaves: Vec<Hash256> = (0..7).map(h).collect();
        assert_eq!(merkle_root(&leaves), merkle_root(&leaves));
    }

    #[test]
    fn root_changes_with_any_leaf() {
        let leaves: Vec<Hash256> = (0..5).map(h).collect();
        let base = merkle_root(&leaves);
        for i in 0..5 {
            let mut modified = leaves.clone();
            modified[i] = h(0xEE);
            assert_ne!(merkle_root(&modified), base, "leaf {i} did not affect root");
        }
    }
}
