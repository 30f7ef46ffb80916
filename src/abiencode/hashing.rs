use sha3::{Digest, Keccak256};

use super::ser::{encode, Tokenize};
use super::types::Hash;

pub fn keccak256(data: &[u8]) -> Hash {
    Hash(Keccak256::digest(data).into())
}

/// Keccak-256 over the canonical ABI encoding of `value`.
///
/// This digest is what both participants sign (after the signed-message
/// prefix, see [sig][crate::sig]) and what the adjudicator recomputes.
pub fn to_hash<T: Tokenize>(value: &T) -> Hash {
    keccak256(&encode(&value.tokenize()))
}
