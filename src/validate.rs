//! The update validator.
//!
//! Given the previous state, a proposed update and the state the proposer
//! claims it produces, decide whether the update is legal. Checks run in a
//! fixed order and stop at the first failure; the validator never panics
//! and never performs I/O.

use crate::channel::{
    ChannelCommitment, ChannelUpdate, FullChannelState, SignedCommitment, UpdateDetails,
};
use crate::error::ValidationError;
use crate::transition::{apply_update, UpdateContext};

/// Validate `update` against `prev`, checking that it produces `proposed`.
///
/// `required_signatures` is 0 for a structural check of a locally built
/// update, 1 for a half-signed inbound update (the proposer's slot must
/// verify) and 2 for a final double-signed update.
pub fn validate_update(
    prev: Option<&FullChannelState>,
    update: &ChannelUpdate,
    proposed: &FullChannelState,
    ctx: &UpdateContext<'_>,
    required_signatures: usize,
) -> Result<(), ValidationError> {
    // Kind-specific preconditions, balance math and the merkle root are all
    // enforced by regenerating the post-state with the pure transition and
    // comparing it against what the proposer claims.
    let regenerated = apply_update(prev, update, ctx)?;

    let expected_nonce = prev.map(|s| s.core.nonce + 1).unwrap_or(1);
    if update.nonce != expected_nonce || proposed.core.nonce != expected_nonce {
        return Err(ValidationError::BadNonce {
            expected: expected_nonce,
            got: update.nonce,
        });
    }

    if let Some(prev) = prev {
        if proposed.core.participants != prev.core.participants
            || proposed.core.channel_address != prev.core.channel_address
            || proposed.public_identifiers != prev.public_identifiers
            || proposed.network_context != prev.network_context
        {
            return Err(ValidationError::BadParticipants);
        }
    }
    if update.channel_address != proposed.core.channel_address {
        return Err(ValidationError::BadParticipants);
    }

    check_against_regenerated(update, proposed, &regenerated.state)?;

    let commitment = SignedCommitment {
        commitment: ChannelCommitment::for_state(proposed),
        signatures: update.signatures,
    };
    commitment.verify(required_signatures)?;

    // A half-signed update must carry the proposer's own signature; a
    // stray signature in the other slot is not a substitute.
    if required_signatures == 1 {
        let proposer = proposed
            .index_of_identifier(&update.from_identifier)
            .ok_or(ValidationError::BadParticipants)?;
        if update.signatures[proposer].is_none() {
            return Err(ValidationError::TooFewSignatures {
                required: 1,
                got: 0,
            });
        }
    }

    Ok(())
}

fn check_against_regenerated(
    update: &ChannelUpdate,
    proposed: &FullChannelState,
    regenerated: &FullChannelState,
) -> Result<(), ValidationError> {
    if proposed.core.asset_ids != regenerated.core.asset_ids
        || proposed.core.balances != regenerated.core.balances
    {
        return Err(ValidationError::ConservationViolated {
            asset: update.asset_id,
        });
    }
    if proposed.core.locked_balance != regenerated.core.locked_balance {
        return Err(ValidationError::LockedBalanceMismatch {
            asset: update.asset_id,
        });
    }
    if proposed.core.merkle_root != regenerated.core.merkle_root {
        return Err(ValidationError::MerkleRootMismatch);
    }
    if proposed.core.latest_deposit_nonce != regenerated.core.latest_deposit_nonce {
        return Err(ValidationError::BadDepositNonce {
            current: regenerated.core.latest_deposit_nonce,
            proposed: proposed.core.latest_deposit_nonce,
        });
    }
    if proposed.core.timeout != regenerated.core.timeout {
        return Err(ValidationError::BadParticipants);
    }

    // For create and resolve the update's balance field must restate the
    // post-update free balance the transition derived; for deposit it was
    // the transition's input, for setup there is nothing to restate.
    match &update.details {
        UpdateDetails::Create(_) | UpdateDetails::Resolve(_) => {
            let idx = regenerated
                .core
                .asset_index(update.asset_id)
                .ok_or(ValidationError::ConservationViolated {
                    asset: update.asset_id,
                })?;
            if update.balance != regenerated.core.balances[idx] {
                return Err(ValidationError::ConservationViolated {
                    asset: update.asset_id,
                });
            }
        }
        UpdateDetails::Setup(_) | UpdateDetails::Deposit(_) => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    use crate::abiencode::types::{Address, U256};
    use crate::channel::{
        derive_channel_address, Balance, DepositDetails, Identifier, NetworkContext, SetupDetails,
    };
    use crate::sig::Signer;

    struct Fixture {
        alice: Signer,
        bob: Signer,
        update: ChannelUpdate,
        state: FullChannelState,
    }

    /// A setup round built from real keys, unsigned.
    fn fixture() -> Fixture {
        let mut rng = StdRng::seed_from_u64(42);
        let alice = Signer::random(&mut rng);
        let bob = Signer::random(&mut rng);
        let participants = [alice.address(), bob.address()];
        let network = NetworkContext {
            chain_id: U256::from(1),
            adjudicator_address: Address([0xaa; 20]),
        };

        let update = ChannelUpdate {
            channel_address: derive_channel_address(&participants, &network),
            from_identifier: Identifier::new("alice"),
            to_identifier: Identifier::new("bob"),
            nonce: 1,
            balance: Balance::empty(participants),
            asset_id: Address::default(),
            details: UpdateDetails::Setup(SetupDetails {
                timeout: 86_400,
                network_context: network,
                participants,
            }),
            signatures: [None, None],
        };
        let state = apply_update(None, &update, &UpdateContext::default())
            .unwrap()
            .state;

        Fixture {
            alice,
            bob,
            update,
            state,
        }
    }

    fn digest_of(state: &FullChannelState) -> crate::abiencode::types::Hash {
        ChannelCommitment::for_state(state).hash()
    }

    #[test]
    fn unsigned_update_passes_the_structural_check() {
        let f = fixture();
        validate_update(None, &f.update, &f.state, &UpdateContext::default(), 0).unwrap();
    }

    #[test]
    fn half_signed_update_passes_with_one_required_signature() {
        let mut f = fixture();
        let sig = f.alice.sign_message(digest_of(&f.state));
        f.update.set_signature(0, sig);
        validate_update(None, &f.update, &f.state, &UpdateContext::default(), 1).unwrap();
    }

    #[test]
    fn proposer_signature_in_the_wrong_slot_is_rejected() {
        let mut f = fixture();
        let sig = f.alice.sign_message(digest_of(&f.state));
        // Alice proposed, but her signature lands in bob's slot.
        f.update.set_signature(1, sig);
        let err = validate_update(None, &f.update, &f.state, &UpdateContext::default(), 1);
        assert_eq!(
            err.unwrap_err(),
            ValidationError::BadSignature { slot: 1 }
        );
    }

    #[test]
    fn signature_from_a_stranger_is_rejected() {
        let mut f = fixture();
        let mut rng = StdRng::seed_from_u64(99);
        let mallory = Signer::random(&mut rng);
        f.update.set_signature(0, mallory.sign_message(digest_of(&f.state)));
        let err = validate_update(None, &f.update, &f.state, &UpdateContext::default(), 1);
        assert_eq!(
            err.unwrap_err(),
            ValidationError::BadSignature { slot: 0 }
        );
    }

    #[test]
    fn double_signed_update_passes_with_two_required_signatures() {
        let mut f = fixture();
        let digest = digest_of(&f.state);
        f.update.set_signature(0, f.alice.sign_message(digest));
        f.update.set_signature(1, f.bob.sign_message(digest));
        validate_update(None, &f.update, &f.state, &UpdateContext::default(), 2).unwrap();
    }

    #[test]
    fn one_signature_is_not_enough_for_a_final_update() {
        let mut f = fixture();
        f.update.set_signature(0, f.alice.sign_message(digest_of(&f.state)));
        let err = validate_update(None, &f.update, &f.state, &UpdateContext::default(), 2);
        assert_eq!(
            err.unwrap_err(),
            ValidationError::TooFewSignatures {
                required: 2,
                got: 1
            }
        );
    }

    #[test]
    fn wrong_nonce_is_rejected_before_signatures() {
        let mut f = fixture();
        f.update.nonce = 5;
        let err = validate_update(None, &f.update, &f.state, &UpdateContext::default(), 0);
        assert_eq!(
            err.unwrap_err(),
            ValidationError::BadNonce {
                expected: 1,
                got: 5
            }
        );
    }

    #[test]
    fn tampered_post_state_balance_is_rejected() {
        let f = fixture();

        // A deposit whose claimed post-state credits more than the update
        // says.
        let update = ChannelUpdate {
            nonce: 2,
            balance: Balance {
                to: f.state.core.participants,
                amount: [U256::from(100), U256::zero()],
            },
            asset_id: Address::default(),
            details: UpdateDetails::Deposit(DepositDetails {
                latest_deposit_nonce: 1,
            }),
            signatures: [None, None],
            ..f.update.clone()
        };
        let mut proposed = apply_update(Some(&f.state), &update, &UpdateContext::default())
            .unwrap()
            .state;
        proposed.core.balances[0].amount[0] = U256::from(200);

        let err = validate_update(Some(&f.state), &update, &proposed, &UpdateContext::default(), 0);
        assert_eq!(
            err.unwrap_err(),
            ValidationError::ConservationViolated {
                asset: Address::default()
            }
        );
    }

    #[test]
    fn participant_set_must_not_change() {
        let f = fixture();
        let update = ChannelUpdate {
            nonce: 2,
            balance: Balance {
                to: f.state.core.participants,
                amount: [U256::from(10), U256::zero()],
            },
            details: UpdateDetails::Deposit(DepositDetails {
                latest_deposit_nonce: 1,
            }),
            ..f.update.clone()
        };
        let mut proposed = apply_update(Some(&f.state), &update, &UpdateContext::default())
            .unwrap()
            .state;
        proposed.core.participants[1] = Address([0xee; 20]);

        let err = validate_update(Some(&f.state), &update, &proposed, &UpdateContext::default(), 0);
        assert_eq!(err.unwrap_err(), ValidationError::BadParticipants);
    }
}
