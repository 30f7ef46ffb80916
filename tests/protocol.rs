//! End-to-end protocol rounds between two engines over the in-memory bus.

use std::sync::Arc;
use std::time::Duration;

use rand::{rngs::StdRng, SeedableRng};
use serde_json::json;
use sha3::{Digest, Keccak256};

use sluice::abiencode::types::{Address, Bytes32, U256};
use sluice::chain::MockChain;
use sluice::channel::{Balance, NetworkContext, SignedCommitment, ChannelCommitment, Identifier};
use sluice::engine::{ChannelEngine, ChannelEvent, CreateParams, EngineConfig, ResolveParams, SetupParams};
use sluice::error::{MessagingError, ProtocolError};
use sluice::messaging::{MemoryBus, ProtocolMessaging};
use sluice::programs::{HashlockProgram, ProgramExecutor, ProgramRegistry};
use sluice::sig::Signer;
use sluice::storage::{MemoryStore, Storage};
use sluice::FullChannelState;

struct Peer {
    engine: Arc<ChannelEngine<MemoryStore, MockChain, MemoryBus>>,
    store: Arc<MemoryStore>,
    identifier: Identifier,
    address: Address,
}

fn spawn_peer(
    name: &str,
    bus: &Arc<MemoryBus>,
    chain: &Arc<MockChain>,
    registry: ProgramRegistry,
    seed: u64,
) -> Peer {
    let identifier = Identifier::new(name);
    let mut rng = StdRng::seed_from_u64(seed);
    let signer = Signer::random(&mut rng);
    let address = signer.address();

    let (messaging, inbound) = ProtocolMessaging::new(identifier.clone(), bus.clone());
    messaging.spawn_delivery(bus.attach(identifier.clone()));

    let store = Arc::new(MemoryStore::new());
    let engine = ChannelEngine::new(
        signer,
        store.clone(),
        chain.clone(),
        messaging,
        ProgramExecutor::new(registry, chain.clone()),
        EngineConfig {
            reply_timeout: Duration::from_millis(500),
            max_retries: 1,
        },
    );
    engine.spawn(inbound);

    Peer {
        engine,
        store,
        identifier,
        address,
    }
}

fn hashlock_registry() -> (ProgramRegistry, Address) {
    let definition = Address([0x42; 20]);
    let mut registry = ProgramRegistry::new();
    registry.register(definition, Arc::new(HashlockProgram));
    (registry, definition)
}

fn network_context() -> NetworkContext {
    NetworkContext {
        chain_id: U256::from(1),
        adjudicator_address: Address([0xaa; 20]),
    }
}

fn assert_double_signed(state: &FullChannelState) {
    let update = state.latest_update.as_ref().expect("accepted state has an update");
    let commitment = SignedCommitment {
        commitment: ChannelCommitment::for_state(state),
        signatures: update.signatures,
    };
    commitment.verify(2).expect("both slots recover to the participants");
}

async fn open_channel(alice: &Peer, bob: &Peer) -> FullChannelState {
    alice
        .engine
        .setup(SetupParams {
            counterparty_identifier: bob.identifier.clone(),
            counterparty_address: bob.address,
            timeout: 86_400,
            network_context: network_context(),
        })
        .await
        .expect("setup round completes")
}

#[tokio::test]
async fn setup_round_produces_a_double_signed_empty_channel() {
    let bus = Arc::new(MemoryBus::new());
    let chain = Arc::new(MockChain::new());
    let (registry, _) = hashlock_registry();
    let alice = spawn_peer("alice", &bus, &chain, registry.clone(), 1);
    let bob = spawn_peer("bob", &bus, &chain, registry, 2);

    let state = open_channel(&alice, &bob).await;

    assert_eq!(state.nonce(), 1);
    assert_eq!(state.core.latest_deposit_nonce, 0);
    assert!(state.core.balances.is_empty());
    assert_eq!(state.core.participants, [alice.address, bob.address]);
    assert_double_signed(&state);

    // Both peers persisted the same state.
    let bob_state = bob
        .store
        .load_channel(state.channel_address())
        .await
        .unwrap()
        .expect("bob persisted the channel");
    assert_eq!(bob_state.core, state.core);
}

#[tokio::test]
async fn full_lifecycle_setup_deposit_create_resolve() {
    let bus = Arc::new(MemoryBus::new());
    let chain = Arc::new(MockChain::new());
    let (registry, hashlock) = hashlock_registry();
    let alice = spawn_peer("alice", &bus, &chain, registry.clone(), 3);
    let bob = spawn_peer("bob", &bus, &chain, registry, 4);
    let mut events = bob.engine.subscribe();

    let state = open_channel(&alice, &bob).await;
    let channel = state.channel_address();
    let asset = Address::default();

    // Deposit: 100 arrives on chain for participant 0.
    chain.deposit(channel, asset, U256::from(100), 1);
    let state = alice.engine.deposit(channel, asset).await.unwrap();
    assert_eq!(state.nonce(), 2);
    assert_eq!(state.core.latest_deposit_nonce, 1);
    assert_eq!(state.core.balances[0].amount, [U256::from(100), U256::zero()]);
    assert_double_signed(&state);

    // Create: alice locks 40 behind a hashlock.
    let preimage = Bytes32([0x55; 32]);
    let lock_hash = Bytes32(Keccak256::digest(preimage.0).into());
    let transfer_id = Bytes32([0x77; 32]);
    let state = alice
        .engine
        .create_transfer(CreateParams {
            channel_address: channel,
            asset_id: asset,
            transfer_id,
            transfer_definition: hashlock,
            transfer_initial_state: json!({ "lockHash": lock_hash.to_hex() }),
            transfer_encodings: [
                "tuple(bytes32 lockHash)".into(),
                "tuple(bytes32 preImage)".into(),
            ],
            transfer_timeout: 3_600,
            balance: Balance {
                to: [alice.address, bob.address],
                amount: [U256::from(40), U256::zero()],
            },
            meta: json!({}),
        })
        .await
        .unwrap();
    assert_eq!(state.nonce(), 3);
    assert_eq!(state.core.balances[0].amount, [U256::from(60), U256::zero()]);
    assert_eq!(state.core.locked_balance[0], U256::from(40));
    assert_double_signed(&state);

    // The root covers exactly the one active transfer, on both sides.
    let bob_transfers = bob.store.load_active_transfers(channel).await.unwrap();
    assert_eq!(bob_transfers.len(), 1);
    assert_eq!(state.core.merkle_root, bob_transfers[0].commitment_hash());

    // Resolve: bob reveals the preimage and takes the 40.
    let state = bob
        .engine
        .resolve_transfer(ResolveParams {
            channel_address: channel,
            transfer_id,
            transfer_resolver: json!({ "preImage": preimage.to_hex() }),
            meta: json!({}),
        })
        .await
        .unwrap();
    assert_eq!(state.nonce(), 4);
    assert_eq!(
        state.core.balances[0].amount,
        [U256::from(60), U256::from(40)]
    );
    assert_eq!(state.core.locked_balance[0], U256::zero());
    assert!(state.core.merkle_root.is_zero());
    assert_double_signed(&state);

    assert!(bob
        .store
        .load_active_transfers(channel)
        .await
        .unwrap()
        .is_empty());
    assert!(alice
        .store
        .load_active_transfers(channel)
        .await
        .unwrap()
        .is_empty());

    // Alice's view agrees field for field.
    let alice_state = alice.store.load_channel(channel).await.unwrap().unwrap();
    assert_eq!(alice_state.core, state.core);

    // The commitment log replays to the current state on both peers.
    assert_eq!(
        alice.store.replay_channel(channel).unwrap().core,
        state.core
    );
    assert_eq!(bob.store.replay_channel(channel).unwrap().core, state.core);

    // Bob observed every round, in nonce order.
    assert!(matches!(events.recv().await.unwrap(), ChannelEvent::ChannelSetup { .. }));
    assert!(matches!(
        events.recv().await.unwrap(),
        ChannelEvent::DepositReconciled { .. }
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        ChannelEvent::TransferCreated { .. }
    ));
    match events.recv().await.unwrap() {
        ChannelEvent::TransferResolved {
            transfer_id: resolved,
            final_balance,
            ..
        } => {
            assert_eq!(resolved, transfer_id);
            assert_eq!(final_balance.amount, [U256::zero(), U256::from(40)]);
        }
        other => panic!("expected TransferResolved, got {other:?}"),
    }
}

#[tokio::test]
async fn wrong_preimage_does_not_resolve() {
    let bus = Arc::new(MemoryBus::new());
    let chain = Arc::new(MockChain::new());
    let (registry, hashlock) = hashlock_registry();
    let alice = spawn_peer("alice", &bus, &chain, registry.clone(), 5);
    let bob = spawn_peer("bob", &bus, &chain, registry, 6);

    let state = open_channel(&alice, &bob).await;
    let channel = state.channel_address();
    let asset = Address::default();
    chain.deposit(channel, asset, U256::from(100), 1);
    alice.engine.deposit(channel, asset).await.unwrap();

    let preimage = Bytes32([0x55; 32]);
    let lock_hash = Bytes32(Keccak256::digest(preimage.0).into());
    let transfer_id = Bytes32([0x78; 32]);
    alice
        .engine
        .create_transfer(CreateParams {
            channel_address: channel,
            asset_id: asset,
            transfer_id,
            transfer_definition: hashlock,
            transfer_initial_state: json!({ "lockHash": lock_hash.to_hex() }),
            transfer_encodings: [
                "tuple(bytes32 lockHash)".into(),
                "tuple(bytes32 preImage)".into(),
            ],
            transfer_timeout: 3_600,
            balance: Balance {
                to: [alice.address, bob.address],
                amount: [U256::from(40), U256::zero()],
            },
            meta: json!({}),
        })
        .await
        .unwrap();

    // The local program errors on a bad preimage and there is no deployed
    // fallback, so the round never leaves bob.
    let err = bob
        .engine
        .resolve_transfer(ResolveParams {
            channel_address: channel,
            transfer_id,
            transfer_resolver: json!({ "preImage": Bytes32([0x56; 32]).to_hex() }),
            meta: json!({}),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Chain(_)));

    // The transfer is still active and the locked balance untouched.
    let state = bob.store.load_channel(channel).await.unwrap().unwrap();
    assert_eq!(state.core.locked_balance[0], U256::from(40));
    assert_eq!(
        bob.store.load_active_transfers(channel).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn stale_initiator_resynchronizes_and_completes() {
    let bus = Arc::new(MemoryBus::new());
    let chain = Arc::new(MockChain::new());
    let (registry, _) = hashlock_registry();
    let alice = spawn_peer("alice", &bus, &chain, registry.clone(), 7);
    let bob = spawn_peer("bob", &bus, &chain, registry, 8);

    let state = open_channel(&alice, &bob).await;
    let channel = state.channel_address();
    let asset = Address::default();

    chain.deposit(channel, asset, U256::from(100), 1);
    let snapshot = alice.engine.deposit(channel, asset).await.unwrap();

    // Bob advances the channel once more...
    chain.deposit(channel, asset, U256::from(50), 2);
    let ahead = bob.engine.deposit(channel, asset).await.unwrap();
    assert_eq!(ahead.nonce(), 3);

    // ...and alice's store is rewound to before that round.
    alice.store.seed_channel(snapshot);

    // Her next round starts one nonce behind, absorbs bob's latest state
    // after his StaleUpdate rejection, and completes on the retry.
    chain.deposit(channel, asset, U256::from(25), 3);
    let state = alice.engine.deposit(channel, asset).await.unwrap();

    assert_eq!(state.nonce(), 4);
    assert_eq!(state.core.latest_deposit_nonce, 3);
    assert_eq!(state.core.balances[0].amount, [U256::from(175), U256::zero()]);
    assert_double_signed(&state);

    let bob_state = bob.store.load_channel(channel).await.unwrap().unwrap();
    assert_eq!(bob_state.core, state.core);
}

#[tokio::test]
async fn unreachable_counterparty_times_out() {
    let bus = Arc::new(MemoryBus::new());
    let chain = Arc::new(MockChain::new());
    let (registry, _) = hashlock_registry();
    let alice = spawn_peer("alice", &bus, &chain, registry, 9);

    // Bob never attaches to the bus.
    let err = alice
        .engine
        .setup(SetupParams {
            counterparty_identifier: Identifier::new("bob"),
            counterparty_address: Address([0xbb; 20]),
            timeout: 86_400,
            network_context: network_context(),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Messaging(MessagingError::Timeout)
    ));
}

#[tokio::test]
async fn rounds_on_different_channels_do_not_interfere() {
    let bus = Arc::new(MemoryBus::new());
    let chain = Arc::new(MockChain::new());
    let (registry, _) = hashlock_registry();
    let alice = spawn_peer("alice", &bus, &chain, registry.clone(), 10);
    let bob = spawn_peer("bob", &bus, &chain, registry.clone(), 11);
    let carol = spawn_peer("carol", &bus, &chain, registry, 12);

    // Two independent channels from alice, advanced concurrently.
    let (to_bob, to_carol) = tokio::join!(
        alice.engine.setup(SetupParams {
            counterparty_identifier: bob.identifier.clone(),
            counterparty_address: bob.address,
            timeout: 86_400,
            network_context: network_context(),
        }),
        alice.engine.setup(SetupParams {
            counterparty_identifier: carol.identifier.clone(),
            counterparty_address: carol.address,
            timeout: 86_400,
            network_context: network_context(),
        }),
    );
    let to_bob = to_bob.unwrap();
    let to_carol = to_carol.unwrap();

    assert_ne!(to_bob.channel_address(), to_carol.channel_address());
    assert_eq!(to_bob.core.participants[1], bob.address);
    assert_eq!(to_carol.core.participants[1], carol.address);

    let (da, db) = {
        chain.deposit(to_bob.channel_address(), Address::default(), U256::from(10), 1);
        chain.deposit(to_carol.channel_address(), Address::default(), U256::from(20), 1);
        tokio::join!(
            alice.engine.deposit(to_bob.channel_address(), Address::default()),
            alice.engine.deposit(to_carol.channel_address(), Address::default()),
        )
    };
    assert_eq!(da.unwrap().core.balances[0].amount[0], U256::from(10));
    assert_eq!(db.unwrap().core.balances[0].amount[0], U256::from(20));
}

#[tokio::test]
async fn duplicate_update_is_rejected_as_stale() {
    let bus = Arc::new(MemoryBus::new());
    let chain = Arc::new(MockChain::new());
    let (registry, _) = hashlock_registry();
    let alice = spawn_peer("alice", &bus, &chain, registry.clone(), 13);
    let bob = spawn_peer("bob", &bus, &chain, registry, 14);

    let state = open_channel(&alice, &bob).await;
    let channel = state.channel_address();
    let asset = Address::default();
    chain.deposit(channel, asset, U256::from(100), 1);
    alice.engine.deposit(channel, asset).await.unwrap();

    // Replaying the same deposit finds nothing new on chain: the update
    // would not advance the deposit nonce and is rejected locally.
    let err = alice.engine.deposit(channel, asset).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Validation(_)));

    let bob_state = bob.store.load_channel(channel).await.unwrap().unwrap();
    assert_eq!(bob_state.nonce(), 2, "no duplicate round was accepted");
}
