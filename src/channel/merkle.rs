//! Merkle root over the set of active transfers.
//!
//! Leaves are the transfers' commitment hashes. Leaves are sorted before
//! pairing so the root is independent of insertion order; an odd leaf is
//! carried up unchanged. The empty set has the all-zero root.

use sha3::{Digest, Keccak256};

use super::FullTransferState;
use crate::abiencode::types::Hash;

pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return Hash::default();
    }

    let mut layer: Vec<Hash> = leaves.to_vec();
    layer.sort_unstable();

    while layer.len() > 1 {
        let mut next = Vec::with_capacity((layer.len() + 1) / 2);
        for pair in layer.chunks(2) {
            next.push(match pair {
                [a, b] => hash_pair(*a, *b),
                [a] => *a,
                _ => unreachable!(),
            });
        }
        layer = next;
    }

    layer[0]
}

pub fn active_transfer_root(transfers: &[FullTransferState]) -> Hash {
    let leaves: Vec<Hash> = transfers.iter().map(|t| t.commitment_hash()).collect();
    merkle_root(&leaves)
}

fn hash_pair(a: Hash, b: Hash) -> Hash {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Keccak256::new();
    hasher.update(lo.0);
    hasher.update(hi.0);
    Hash(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_has_zero_root() {
        assert_eq!(merkle_root(&[]), Hash::default());
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let leaf: Hash = rand::random();
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn root_is_order_independent() {
        let a: Hash = rand::random();
        let b: Hash = rand::random();
        let c: Hash = rand::random();
        assert_eq!(merkle_root(&[a, b, c]), merkle_root(&[c, a, b]));
    }

    #[test]
    fn adding_a_leaf_changes_the_root() {
        let a: Hash = rand::random();
        let b: Hash = rand::random();
        assert_ne!(merkle_root(&[a]), merkle_root(&[a, b]));
    }
}
