//! The bytes both participants sign.

use serde::{Deserialize, Serialize};

use super::{CoreChannelState, FullChannelState, PARTICIPANTS};
use crate::abiencode::{
    to_hash,
    ser::{Token, Tokenize},
    types::{Address, Hash, Signature, U256},
};
use crate::error::ValidationError;
use crate::sig::recover_signer;

/// The commitment triple. Signatures are never part of the preimage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCommitment {
    pub chain_id: U256,
    pub state: CoreChannelState,
    pub adjudicator_address: Address,
}

impl ChannelCommitment {
    pub fn for_state(state: &FullChannelState) -> Self {
        ChannelCommitment {
            chain_id: state.network_context.chain_id,
            state: state.core.clone(),
            adjudicator_address: state.network_context.adjudicator_address,
        }
    }

    /// The digest handed to the signer and to signature recovery.
    pub fn hash(&self) -> Hash {
        to_hash(self)
    }
}

impl Tokenize for ChannelCommitment {
    fn tokenize(&self) -> Token {
        Token::Tuple(vec![
            Token::Uint(self.chain_id),
            self.state.tokenize(),
            Token::Address(self.adjudicator_address),
        ])
    }
}

/// A commitment plus whichever signature slots have been filled so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedCommitment {
    #[serde(flatten)]
    pub commitment: ChannelCommitment,
    pub signatures: [Option<Signature>; PARTICIPANTS],
}

impl SignedCommitment {
    /// Check that every filled slot recovers to the matching participant
    /// and that at least `required` slots are filled.
    pub fn verify(&self, required: usize) -> Result<(), ValidationError> {
        let filled = self.signatures.iter().filter(|s| s.is_some()).count();
        if filled < required {
            return Err(ValidationError::TooFewSignatures {
                required,
                got: filled,
            });
        }

        let digest = self.commitment.hash();
        for (slot, sig) in self.signatures.iter().enumerate() {
            let Some(sig) = sig else { continue };
            let recovered = recover_signer(digest, sig)
                .map_err(|_| ValidationError::BadSignature { slot })?;
            if recovered != self.commitment.state.participants[slot] {
                return Err(ValidationError::BadSignature { slot });
            }
        }
        Ok(())
    }
}
