//! Creation and verification of Ethereum-style recoverable signatures.
//!
//! A signature is only ever judged by one criterion: the address recovered
//! from `(digest, signature)` must equal the participant address for the
//! slot it occupies. Everything else (timing, transport, message shape) is
//! the protocol layer's business.

use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    All, Message, Secp256k1, SecretKey,
};
use sha3::{Digest, Keccak256};

use crate::abiencode::types::{Address, Hash, Signature};

pub use secp256k1::Error;

/// Add the `\x19Ethereum Signed Message\n32` prefix to a digest. This is the
/// format the adjudicator contracts expect when recovering signers.
fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding, so the ABI serializer is of no use here.
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}

/// Private-key custody for one participant.
#[derive(Debug)]
pub struct Signer {
    secp: Secp256k1<All>,
    sk: SecretKey,
    addr: Address,
}

impl Signer {
    /// Generate a fresh keypair.
    pub fn random<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let secp = Secp256k1::new();
        let (sk, pk) = secp.generate_keypair(rng);
        Self {
            secp,
            sk,
            addr: pk.into(),
        }
    }

    /// Load a signer from raw secret-key bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, Error> {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(bytes)?;
        let pk = sk.public_key(&secp);
        Ok(Self {
            secp,
            sk,
            addr: pk.into(),
        })
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    /// Sign a digest as a 65-byte recoverable signature.
    ///
    /// The recovery id is stored in the final byte with the historical +27
    /// offset, which is what `ecrecover` and the OpenZeppelin ECDSA library
    /// expect.
    pub fn sign_message(&self, digest: Hash) -> Signature {
        let hash = hash_to_eth_signed_msg_hash(digest);

        let sig = self
            .secp
            .sign_ecdsa_recoverable(&Message::from(hash), &self.sk);
        let (v, rs) = sig.serialize_compact();

        // The library produces low-s signatures; anything else would be
        // rejected on chain per EIP-2.
        debug_assert!(rs[32] & 0x80 == 0);

        Signature::new(&rs, 27 + v.to_i32() as u8)
    }
}

/// Recover the address that produced `sig` over `digest`.
///
/// `digest` is the plain commitment digest, without the signed-message
/// prefix; the prefix is applied here, mirroring [Signer::sign_message].
pub fn recover_signer(digest: Hash, sig: &Signature) -> Result<Address, Error> {
    let hash = hash_to_eth_signed_msg_hash(digest);

    let rs = &sig.0[..64];
    let v = sig.0[64].wrapping_sub(27);

    let recid = RecoveryId::from_i32(v.into())?;
    let sig = RecoverableSignature::from_compact(rs, recid)?;

    let secp = Secp256k1::new();
    let pk = secp.recover_ecdsa(&Message::from(hash), &sig)?;

    Ok(pk.into())
}
