//! Primitive on-chain types shared by the whole crate.
//!
//! Everything that ends up inside a commitment preimage lives here, with the
//! exact serialization the rest of the stack expects: ABI slots for hashing
//! (see [ser][super::ser]) and `0x`-prefixed hex or decimal strings on the
//! JSON wire.

use core::fmt::Debug;

use rand::{distributions::Standard, prelude::Distribution};
use secp256k1::{PublicKey, ThirtyTwoByteHash};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use uint::construct_uint;

macro_rules! impl_hex_debug {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }
    };
}

macro_rules! bytes_newtype {
    ( $T:ident, $N:literal ) => {
        #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
        pub struct $T(pub [u8; $N]);

        impl $T {
            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }

            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                let mut out = [0u8; $N];
                hex::decode_to_slice(s, &mut out)?;
                Ok(Self(out))
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl Serialize for $T {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(de::Error::custom)
            }
        }

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                let mut out = [0u8; $N];
                rng.fill_bytes(&mut out);
                $T(out)
            }
        }

        impl_hex_debug!($T);
    };
}

bytes_newtype!(Bytes32, 32);
bytes_newtype!(Hash, 32);
bytes_newtype!(Signature, 65);

impl Signature {
    pub fn new(rs: &[u8; 64], v: u8) -> Self {
        let mut sig = Signature([0; 65]);
        sig.0[..64].copy_from_slice(rs);
        sig.0[64] = v;
        sig
    }
}

impl ThirtyTwoByteHash for Hash {
    fn into_32(self) -> [u8; 32] {
        self.0
    }
}

impl From<Bytes32> for Hash {
    fn from(b: Bytes32) -> Self {
        Hash(b.0)
    }
}

bytes_newtype!(Address, 20);

impl From<PublicKey> for Address {
    fn from(pk: PublicKey) -> Self {
        // The first byte of the uncompressed encoding is the format tag, not
        // part of the key material.
        let hash: [u8; 32] = Keccak256::digest(&pk.serialize_uncompressed()[1..]).into();

        let mut addr = Address([0; 20]);
        addr.0.copy_from_slice(&hash[32 - 20..]);
        addr
    }
}

construct_uint! {
    pub struct U256(4);
}

// On the wire amounts travel as decimal strings so arbitrary-precision
// clients never truncate them.
impl Serialize for U256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for U256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        U256::from_dec_str(&s).map_err(de::Error::custom)
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}
