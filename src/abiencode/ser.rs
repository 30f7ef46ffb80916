//! Canonical Solidity ABI encoding of commitment preimages.
//!
//! The on-chain adjudicator recomputes `keccak256(abi.encode(...))` over the
//! same values, so the byte layout produced here must match the ABI
//! specification exactly: 32-byte slots, right-aligned integers and
//! addresses, left-aligned fixed bytes, dynamic values referenced from the
//! head of the enclosing tuple by byte offset.

use super::types::{Address, Bytes32, U256};

const SLOT_SIZE: usize = 32;

/// A value in the ABI type system.
///
/// Signed types lower themselves into a token tree (see [Tokenize]) and the
/// encoder walks that tree. This keeps the slot arithmetic in one place
/// instead of spreading it over every struct that ends up in a preimage.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Uint(U256),
    Address(Address),
    FixedBytes(Bytes32),
    Bool(bool),
    Bytes(Vec<u8>),
    Array(Vec<Token>),
    Tuple(Vec<Token>),
}

/// Lowering of a Rust type into its ABI token tree.
pub trait Tokenize {
    fn tokenize(&self) -> Token;
}

impl Tokenize for Token {
    fn tokenize(&self) -> Token {
        self.clone()
    }
}

impl Token {
    pub fn uint(v: u64) -> Token {
        Token::Uint(U256::from(v))
    }

    fn is_dynamic(&self) -> bool {
        match self {
            Token::Bytes(_) | Token::Array(_) => true,
            Token::Tuple(fields) => fields.iter().any(Token::is_dynamic),
            _ => false,
        }
    }

    /// Bytes this token occupies in the head of the enclosing tuple.
    fn head_size(&self) -> usize {
        if self.is_dynamic() {
            SLOT_SIZE
        } else {
            self.in_place_size()
        }
    }

    /// Bytes of the in-place encoding. Only meaningful for static tokens.
    fn in_place_size(&self) -> usize {
        match self {
            Token::Tuple(fields) => fields.iter().map(Token::in_place_size).sum(),
            _ => SLOT_SIZE,
        }
    }

    /// Bytes of the standalone encoding, i.e. what gets written into the
    /// tail when the token is dynamic.
    fn standalone_size(&self) -> usize {
        match self {
            Token::Bytes(data) => SLOT_SIZE + pad32(data.len()),
            Token::Array(items) => SLOT_SIZE + list_size(items),
            Token::Tuple(fields) if self.is_dynamic() => list_size(fields),
            _ => self.in_place_size(),
        }
    }

    fn encode_in_place(&self, out: &mut Vec<u8>) {
        match self {
            Token::Uint(v) => {
                let mut word = [0u8; SLOT_SIZE];
                v.to_big_endian(&mut word);
                out.extend_from_slice(&word);
            }
            Token::Address(a) => {
                let mut word = [0u8; SLOT_SIZE];
                word[SLOT_SIZE - 20..].copy_from_slice(&a.0);
                out.extend_from_slice(&word);
            }
            Token::FixedBytes(b) => out.extend_from_slice(&b.0),
            Token::Bool(v) => {
                let mut word = [0u8; SLOT_SIZE];
                word[SLOT_SIZE - 1] = *v as u8;
                out.extend_from_slice(&word);
            }
            Token::Tuple(fields) => {
                for field in fields {
                    field.encode_in_place(out);
                }
            }
            // is_dynamic() routes these into encode_standalone.
            Token::Bytes(_) | Token::Array(_) => unreachable!("dynamic token written in place"),
        }
    }

    fn encode_standalone(&self, out: &mut Vec<u8>) {
        match self {
            Token::Bytes(data) => {
                write_len(out, data.len());
                out.extend_from_slice(data);
                out.resize(out.len() + pad32(data.len()) - data.len(), 0);
            }
            Token::Array(items) => {
                write_len(out, items.len());
                encode_list(items, out);
            }
            Token::Tuple(fields) if self.is_dynamic() => encode_list(fields, out),
            _ => self.encode_in_place(out),
        }
    }
}

fn pad32(len: usize) -> usize {
    (len + 31) / 32 * 32
}

fn list_size(items: &[Token]) -> usize {
    items
        .iter()
        .map(|t| t.head_size() + if t.is_dynamic() { t.standalone_size() } else { 0 })
        .sum()
}

fn write_len(out: &mut Vec<u8>, len: usize) {
    let mut word = [0u8; SLOT_SIZE];
    word[SLOT_SIZE - 8..].copy_from_slice(&(len as u64).to_be_bytes());
    out.extend_from_slice(&word);
}

/// Head/tail encoding of a parameter list: static members in place, dynamic
/// members as an offset into the tail that follows the head.
fn encode_list(items: &[Token], out: &mut Vec<u8>) {
    let head: usize = items.iter().map(Token::head_size).sum();
    let mut tail: Vec<u8> = Vec::new();
    for item in items {
        if item.is_dynamic() {
            write_len(out, head + tail.len());
            item.encode_standalone(&mut tail);
        } else {
            item.encode_in_place(out);
        }
    }
    out.extend_from_slice(&tail);
}

/// Encode a single value the way `abi.encode(value)` does on chain: as a
/// one-element parameter list, so a dynamic value is preceded by its offset.
pub fn encode(token: &Token) -> Vec<u8> {
    let mut out = Vec::with_capacity(token.head_size() + token.standalone_size());
    encode_list(core::slice::from_ref(token), &mut out);
    out
}
