/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Deterministic tests that drive the [`Core`] state machine directly, with mock providers and no
//! threads. The threaded end-to-end tests live in the `tests/` directory; everything that depends
//! on precise message ordering or injected failures is tested here instead, where ordering is
//! under the test's control.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};

use crate::backup::{BackupError, BackupStore, COMMITTED_KEY};
use crate::chain::{Chain, ChainError, ExecutedBlock};
use crate::config::Configuration;
use crate::events::Event;
use crate::networking::{network::PeerNetwork, sending::Broadcaster};
use crate::roster::{AccountType, Roster};
use crate::types::{
    basic::{BlockHeight, CryptoHash, ReplicaIndex, ViewNumber},
    block::BlockSummary,
    keypair::Keypair,
};

use super::messages::{Commit, ConsensusMessage, MessageKind, Prepare, Sign, ViewChange};
use super::protocol::{Core, ProtocolError};

/// Number of miners in every test cluster. `f = 1`, `quorum = 3`.
const N: usize = 4;

#[derive(Clone)]
struct TestRoster {
    miners: Vec<VerifyingKey>,
}

impl Roster for TestRoster {
    fn account_type(&self, key: &VerifyingKey) -> Option<AccountType> {
        self.miners.contains(key).then_some(AccountType::Miner)
    }

    fn index_of(&self, key: &VerifyingKey) -> Option<ReplicaIndex> {
        self.miners
            .iter()
            .position(|miner| miner == key)
            .map(|pos| ReplicaIndex::new(pos as u64))
    }

    fn public_key(&self, idx: ReplicaIndex) -> Option<VerifyingKey> {
        self.miners.get(idx.int() as usize).copied()
    }

    fn miner_count(&self) -> u64 {
        self.miners.len() as u64
    }

    fn miner_list(&self, _height: BlockHeight) -> Option<Vec<VerifyingKey>> {
        Some(self.miners.clone())
    }
}

/// Records everything the core sends. `recv` always reports an empty network: tests inject
/// messages by calling handlers directly.
#[derive(Clone)]
struct TestNet {
    peers: Vec<VerifyingKey>,
    connected: Arc<Mutex<Vec<VerifyingKey>>>,
    sent: Arc<Mutex<Vec<(VerifyingKey, ConsensusMessage)>>>,
}

impl TestNet {
    fn new(peers: Vec<VerifyingKey>) -> TestNet {
        TestNet {
            connected: Arc::new(Mutex::new(peers.clone())),
            peers,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn disconnect(&self, peer: &VerifyingKey) {
        self.connected.lock().unwrap().retain(|p| p != peer);
    }

    fn sent_kinds(&self) -> Vec<MessageKind> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, msg)| msg.kind())
            .collect()
    }

    fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl PeerNetwork for TestNet {
    fn connected_peers(&self) -> Vec<VerifyingKey> {
        self.peers.clone()
    }

    fn is_connected(&self, peer: &VerifyingKey) -> bool {
        self.connected.lock().unwrap().contains(peer)
    }

    fn send(&mut self, peer: &VerifyingKey, message: ConsensusMessage) {
        self.sent.lock().unwrap().push((*peer, message));
    }

    fn recv(&mut self) -> Option<(VerifyingKey, ConsensusMessage)> {
        None
    }
}

/// Test block format: Borsh of `(height, transaction count, payload)`, hashed with SHA-256.
/// Execution recomputes the hash from the bytes and returns the block unchanged.
struct TestChain {
    miners: Vec<VerifyingKey>,
}

fn make_block(height: u64, transactions: u64) -> (Vec<u8>, CryptoHash) {
    let bytes = (BlockHeight::new(height), transactions, vec![0u8; 8])
        .try_to_vec()
        .unwrap();
    let hash = CryptoHash::new(Sha256::digest(&bytes).into());
    (bytes, hash)
}

impl Chain for TestChain {
    fn check_block_valid(
        &mut self,
        _claimed_hash: &CryptoHash,
        block: &[u8],
    ) -> Result<ExecutedBlock, ChainError> {
        let (height, transactions, _payload) =
            <(BlockHeight, u64, Vec<u8>)>::try_from_slice(block)
                .map_err(|err| ChainError::Malformed(err.to_string()))?;
        let hash = CryptoHash::new(Sha256::digest(block).into());
        Ok(ExecutedBlock {
            received_hash: hash,
            header: BlockSummary {
                height,
                hash,
                node_list: self.miners.clone(),
            },
            block: block.to_vec(),
            transaction_count: transactions,
        })
    }

    fn add_block_cache(&mut self, _executed: &ExecutedBlock) {}

    fn block(&self, _hash: &CryptoHash) -> Option<Vec<u8>> {
        None
    }
}

#[derive(Clone, Default)]
struct MemBackup(Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>);

impl BackupStore for MemBackup {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(key).cloned()
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), BackupError> {
        self.0.lock().unwrap().insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

/// One core under test plus everything needed to poke at it.
struct Harness {
    core: Core<TestNet, TestRoster, TestChain, MemBackup>,
    keypairs: Vec<Keypair>,
    net: TestNet,
    backup: MemBackup,
    events: Receiver<Event>,
}

impl Harness {
    /// A core for the miner at `self_idx`, with a zero base timeout so that every explicit
    /// `check_timeout` call fires.
    fn new(self_idx: usize) -> Harness {
        Harness::with_config(self_idx, Configuration {
            view_timeout: Duration::ZERO,
            log_events: false,
            ..Configuration::default()
        })
    }

    fn with_config(self_idx: usize, config: Configuration) -> Harness {
        Harness::build(self_idx, config, MemBackup::default())
    }

    fn build(self_idx: usize, config: Configuration, backup: MemBackup) -> Harness {
        let signing_keys: Vec<SigningKey> =
            (0..N).map(|_| SigningKey::generate(&mut OsRng)).collect();
        let keypairs: Vec<Keypair> = signing_keys
            .iter()
            .map(|sk| Keypair::new(sk.clone()))
            .collect();
        let miners: Vec<VerifyingKey> = keypairs.iter().map(|kp| kp.public()).collect();

        let peers: Vec<VerifyingKey> = miners
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self_idx)
            .map(|(_, key)| *key)
            .collect();
        let net = TestNet::new(peers);
        let roster = TestRoster {
            miners: miners.clone(),
        };
        let broadcaster = Broadcaster::new(net.clone(), roster.clone(), config.seen_filter_capacities);
        let (event_publisher, events) = mpsc::channel();

        let core = Core::new(
            config,
            Keypair::new(signing_keys[self_idx].clone()),
            roster,
            TestChain { miners },
            backup.clone(),
            broadcaster,
            Some(event_publisher),
        );

        Harness {
            core,
            keypairs,
            net,
            backup,
            events,
        }
    }

    /// Report a chain tip at height 9 so that the primary for the next slot under view 0 is
    /// miner 1.
    fn report_tip_9(&mut self) -> BlockSummary {
        let tip = BlockSummary {
            height: BlockHeight::new(9),
            hash: CryptoHash::new([9; 32]),
            node_list: self.keypairs.iter().map(|kp| kp.public()).collect(),
        };
        self.core.report_block(tip.clone());
        tip
    }

    fn prepare_from(&self, idx: usize, view: u64, block: &[u8], hash: CryptoHash) -> Prepare {
        Prepare::new(
            &self.keypairs[idx],
            BlockHeight::new(10),
            ViewNumber::new(view),
            ReplicaIndex::new(idx as u64),
            hash,
            block.to_vec(),
        )
    }

    fn sign_from(&self, idx: usize, view: u64, hash: CryptoHash) -> Sign {
        Sign::new(
            &self.keypairs[idx],
            BlockHeight::new(10),
            ViewNumber::new(view),
            ReplicaIndex::new(idx as u64),
            hash,
        )
    }

    fn commit_from(&self, idx: usize, view: u64, hash: CryptoHash) -> Commit {
        Commit::new(
            &self.keypairs[idx],
            BlockHeight::new(10),
            ViewNumber::new(view),
            ReplicaIndex::new(idx as u64),
            hash,
        )
    }

    fn view_change_from(&self, idx: usize, height: u64, view: u64, hash: CryptoHash) -> ViewChange {
        ViewChange::new(
            &self.keypairs[idx],
            BlockHeight::new(height),
            ViewNumber::new(view),
            ReplicaIndex::new(idx as u64),
            hash,
        )
    }

    fn public(&self, idx: usize) -> VerifyingKey {
        self.keypairs[idx].public()
    }

    fn seal_events(&self) -> Vec<(BlockHeight, bool, usize)> {
        let mut seals = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let Event::SealGenerated(seal) = event {
                seals.push((seal.height, seal.is_primary, seal.block.signatures.len()));
            }
        }
        seals
    }
}

#[test]
fn three_phase_flow_emits_exactly_once() {
    let mut harness = Harness::new(0);
    harness.report_tip_9();
    let (block, hash) = make_block(10, 2);

    // Primary for (view 0, tip 9) is miner 1.
    let prepare = harness.prepare_from(1, 0, &block, hash);
    harness
        .core
        .handle_prepare(ReplicaIndex::new(1), harness.public(1), prepare, false)
        .unwrap();

    // Accepting the proposal makes us vote.
    assert!(harness.net.sent_kinds().contains(&MessageKind::Sign));
    assert_eq!(harness.core.sign_count(&hash), 1);

    // Two more sign votes complete the quorum of 3: the checkpoint is persisted and our commit
    // vote goes out.
    let sign = harness.sign_from(2, 0, hash);
    harness.core.handle_sign(harness.public(2), sign).unwrap();
    let sign = harness.sign_from(3, 0, hash);
    harness.core.handle_sign(harness.public(3), sign).unwrap();

    assert_eq!(harness.core.committed_prepare_height(), Some(BlockHeight::new(10)));
    assert!(harness.backup.get(COMMITTED_KEY).is_some());
    assert!(harness.net.sent_kinds().contains(&MessageKind::Commit));

    // Two more commit votes complete the commit quorum: the block is sealed.
    let commit = harness.commit_from(2, 0, hash);
    harness.core.handle_commit(harness.public(2), commit).unwrap();
    let commit = harness.commit_from(3, 0, hash);
    harness.core.handle_commit(harness.public(3), commit).unwrap();

    // A straggler vote after emission must not seal twice.
    let commit = harness.commit_from(2, 0, hash);
    assert!(matches!(
        harness.core.handle_commit(harness.public(2), commit),
        Err(ProtocolError::Duplicate)
    ));

    let seals = harness.seal_events();
    assert_eq!(seals.len(), 1);
    let (height, is_primary, signature_count) = seals[0];
    assert_eq!(height, BlockHeight::new(10));
    assert!(!is_primary);
    // The certificate carries all three collected commit votes.
    assert_eq!(signature_count, 3);
}

#[test]
fn prepare_from_non_primary_is_rejected() {
    let mut harness = Harness::new(0);
    harness.report_tip_9();
    let (block, hash) = make_block(10, 2);

    let prepare = harness.prepare_from(2, 0, &block, hash);
    assert!(matches!(
        harness
            .core
            .handle_prepare(ReplicaIndex::new(2), harness.public(2), prepare, false),
        Err(ProtocolError::WrongLeader)
    ));
}

#[test]
fn prepare_with_foreign_signature_is_rejected() {
    let mut harness = Harness::new(0);
    harness.report_tip_9();
    let (block, hash) = make_block(10, 2);

    // Signed by miner 2 but claiming miner 1 (the primary) as author.
    let mut prepare = harness.prepare_from(2, 0, &block, hash);
    prepare.idx = ReplicaIndex::new(1);
    assert!(matches!(
        harness
            .core
            .handle_prepare(ReplicaIndex::new(1), harness.public(1), prepare, false),
        Err(ProtocolError::BadSignature)
    ));
}

#[test]
fn prepare_with_mismatched_block_bytes_is_rejected() {
    let mut harness = Harness::new(0);
    harness.report_tip_9();
    let (block, _) = make_block(10, 2);
    let claimed = CryptoHash::new([42; 32]);

    let prepare = harness.prepare_from(1, 0, &block, claimed);
    assert!(matches!(
        harness
            .core
            .handle_prepare(ReplicaIndex::new(1), harness.public(1), prepare, false),
        Err(ProtocolError::BlockMismatch)
    ));
}

#[test]
fn future_prepare_is_parked_and_drained_on_height_advance() {
    let mut harness = Harness::new(0);
    harness.report_tip_9();
    let (block, hash) = make_block(11, 2);

    // A proposal for height 11 while we agree on height 10: parked, not processed.
    let prepare = Prepare::new(
        &harness.keypairs[2],
        BlockHeight::new(11),
        ViewNumber::new(0),
        ReplicaIndex::new(2),
        hash,
        block.clone(),
    );
    assert!(matches!(
        harness
            .core
            .handle_prepare(ReplicaIndex::new(2), harness.public(2), prepare, false),
        Err(ProtocolError::Future)
    ));
    assert!(harness.core.has_future_prepare());
    assert!(!harness.net.sent_kinds().contains(&MessageKind::Sign));

    // Height 10 commits; the parked proposal is now current (primary for (0, 10) is miner 2) and
    // is drained into the normal handler.
    harness.core.report_block(BlockSummary {
        height: BlockHeight::new(10),
        hash: CryptoHash::new([10; 32]),
        node_list: harness.keypairs.iter().map(|kp| kp.public()).collect(),
    });
    harness.core.handle_future_block();

    assert!(!harness.core.has_future_prepare());
    assert_eq!(harness.core.sign_count(&hash), 1);
    assert!(harness.net.sent_kinds().contains(&MessageKind::Sign));
}

#[test]
fn empty_block_hands_the_slot_over() {
    let mut harness = Harness::with_config(0, Configuration {
        view_timeout: Duration::ZERO,
        omit_empty_block: true,
        log_events: false,
        ..Configuration::default()
    });
    harness.report_tip_9();
    let (block, hash) = make_block(10, 0);

    let prepare = harness.prepare_from(1, 0, &block, hash);
    harness
        .core
        .handle_prepare(ReplicaIndex::new(1), harness.public(1), prepare, false)
        .unwrap();

    // No vote goes out for an empty block; the leader is marked failed instead.
    assert!(!harness.net.sent_kinds().contains(&MessageKind::Sign));
    assert!(harness.core.is_leader_failed());

    // The zeroed anchors make the next timeout check fire immediately.
    harness.core.check_timeout();
    assert_eq!(harness.core.to_view(), ViewNumber::new(1));
    assert!(harness.net.sent_kinds().contains(&MessageKind::ViewChange));
}

#[test]
fn split_votes_cannot_reach_quorum_and_timeout_recovers() {
    // Scenario: the primary equivocated, so this node holds votes for H while others hold votes
    // for H'. Neither side reaches 3; the slot recovers through a view change.
    let mut harness = Harness::new(0);
    harness.report_tip_9();
    let (block, hash) = make_block(10, 2);

    let prepare = harness.prepare_from(1, 0, &block, hash);
    harness
        .core
        .handle_prepare(ReplicaIndex::new(1), harness.public(1), prepare, false)
        .unwrap();
    let sign = harness.sign_from(3, 0, hash);
    harness.core.handle_sign(harness.public(3), sign).unwrap();

    assert_eq!(harness.core.sign_count(&hash), 2);
    assert!(!harness.net.sent_kinds().contains(&MessageKind::Commit));

    // Timeout: this node proposes view 1 and collects the two other view changes it needs.
    harness.core.check_timeout();
    assert_eq!(harness.core.to_view(), ViewNumber::new(1));

    let tip_hash = CryptoHash::new([9; 32]);
    for idx in [2, 3] {
        let view_change = harness.view_change_from(idx, 9, 1, tip_hash);
        harness
            .core
            .handle_view_change(ReplicaIndex::new(idx as u64), harness.public(idx), view_change)
            .unwrap();
    }
    assert_eq!(harness.core.view(), ViewNumber::new(1));

    // The vote caches were cleared with the view change, and the new primary (miner 2) can now
    // propose the same height afresh.
    assert_eq!(harness.core.sign_count(&hash), 0);
    let prepare = harness.prepare_from(2, 1, &block, hash);
    harness
        .core
        .handle_prepare(ReplicaIndex::new(2), harness.public(2), prepare, false)
        .unwrap();
    assert_eq!(harness.core.sign_count(&hash), 1);
}

#[test]
fn view_does_not_decrease_within_a_height() {
    let mut harness = Harness::new(0);
    harness.report_tip_9();

    let tip_hash = CryptoHash::new([9; 32]);
    let mut last_view = harness.core.view();
    for round in 1..=3u64 {
        harness.core.check_timeout();
        for idx in [2, 3] {
            let view_change = harness.view_change_from(idx, 9, round, tip_hash);
            let _ = harness.core.handle_view_change(
                ReplicaIndex::new(idx as u64),
                harness.public(idx),
                view_change,
            );
        }
        assert!(harness.core.view() >= last_view);
        last_view = harness.core.view();
    }
    assert_eq!(last_view, ViewNumber::new(3));
}

#[test]
fn fast_view_change_jumps_to_the_cluster_view() {
    // Scenario S5: this node restarted with view 0 while the rest of the cluster is at view 5.
    let mut harness = Harness::new(3);
    harness.report_tip_9();
    let tip_hash = CryptoHash::new([9; 32]);

    // Evidence from one peer is not enough (f = 1).
    let view_change = harness.view_change_from(0, 9, 5, tip_hash);
    harness
        .core
        .handle_view_change(ReplicaIndex::new(0), harness.public(0), view_change)
        .unwrap();
    assert_eq!(harness.core.to_view(), ViewNumber::new(0));

    // A second peer pushes the count past f: jump to one short of the cluster view.
    let view_change = harness.view_change_from(1, 9, 5, tip_hash);
    harness
        .core
        .handle_view_change(ReplicaIndex::new(1), harness.public(1), view_change)
        .unwrap();
    assert_eq!(harness.core.to_view(), ViewNumber::new(4));

    // The zeroed anchors fire the next timeout check, which ticks to_view to 5; the two cached
    // view changes at 5 then complete the change through the normal path.
    harness.core.check_timeout();
    assert_eq!(harness.core.view(), ViewNumber::new(5));
}

#[test]
fn fast_view_change_waits_for_an_unsaved_committed_block() {
    // This node reached the sign quorum for height 10 but the block is not yet on its chain.
    // Peers whose tip is already 10 are view-changing; jumping with them would strand the block.
    let mut harness = Harness::new(0);
    harness.report_tip_9();
    let (block, hash) = make_block(10, 2);

    let prepare = harness.prepare_from(1, 0, &block, hash);
    harness
        .core
        .handle_prepare(ReplicaIndex::new(1), harness.public(1), prepare, false)
        .unwrap();
    for idx in [2, 3] {
        let sign = harness.sign_from(idx, 0, hash);
        harness.core.handle_sign(harness.public(idx), sign).unwrap();
    }
    assert_eq!(harness.core.committed_prepare_height(), Some(BlockHeight::new(10)));

    let block_10_hash = CryptoHash::new([10; 32]);
    for idx in [2, 3] {
        let view_change = harness.view_change_from(idx, 10, 5, block_10_hash);
        harness
            .core
            .handle_view_change(ReplicaIndex::new(idx as u64), harness.public(idx), view_change)
            .unwrap();
    }

    // Enough signers are ahead, but the anti-premature guard holds us back.
    assert_eq!(harness.core.to_view(), ViewNumber::new(0));
}

#[test]
fn restored_checkpoint_is_replayed_instead_of_sealing() {
    // Scenario S6: a primary that crashed between the sign quorum and block persistence restarts
    // with the committed prepare in its backup store.
    let (block, hash) = make_block(10, 2);

    let backup = MemBackup::default();
    let mut seed = Harness::build(
        1,
        Configuration {
            view_timeout: Duration::ZERO,
            log_events: false,
            ..Configuration::default()
        },
        backup.clone(),
    );
    // Run miner 1 (the primary for the slot) up to the sign quorum so the checkpoint lands in
    // `backup`, then throw this core away: it "crashed".
    seed.report_tip_9();
    let view = seed
        .core
        .generate_seal(
            &BlockSummary {
                height: BlockHeight::new(10),
                hash,
                node_list: seed.keypairs.iter().map(|kp| kp.public()).collect(),
            },
            &block,
        )
        .unwrap();
    seed.core
        .generate_commit(
            &BlockSummary {
                height: BlockHeight::new(10),
                hash,
                node_list: seed.keypairs.iter().map(|kp| kp.public()).collect(),
            },
            &block,
            view,
        )
        .unwrap();
    for idx in [2, 3] {
        let sign = seed.sign_from(idx, 0, hash);
        seed.core.handle_sign(seed.public(idx), sign).unwrap();
    }
    assert!(backup.get(COMMITTED_KEY).is_some());

    // Restart: same keypairs are not preserved by Harness::build, so restore manually into a
    // fresh core for the same miner set by reusing the backup through a new harness.
    let mut restarted = Harness::build(
        1,
        Configuration {
            view_timeout: Duration::from_secs(600),
            log_events: false,
            ..Configuration::default()
        },
        backup.clone(),
    );
    restarted.report_tip_9();

    assert_eq!(
        restarted.core.committed_prepare_height(),
        Some(BlockHeight::new(10))
    );

    // The sealing gate refuses a fresh block and instead replays the saved proposal.
    assert!(!restarted.core.should_seal());
    let kinds = restarted.net.sent_kinds();
    assert!(kinds.contains(&MessageKind::Prepare));
    assert!(kinds.contains(&MessageKind::Sign));

    // A second query neither seals nor replays again.
    restarted.net.clear_sent();
    assert!(!restarted.core.should_seal());
    assert!(!restarted.net.sent_kinds().contains(&MessageKind::Prepare));
}

#[test]
fn disconnected_primary_forces_fast_view_change() {
    // A long base timeout, so only the zeroed anchors can make the timeout fire.
    let mut harness = Harness::with_config(0, Configuration {
        view_timeout: Duration::from_secs(600),
        log_events: false,
        ..Configuration::default()
    });
    harness.report_tip_9();

    // The primary for the slot (miner 1) drops off the network.
    harness.net.disconnect(&harness.public(1));
    assert!(!harness.core.should_seal());

    // should_seal zeroed the anchors, so even a long base timeout fires now.
    harness.core.check_timeout();
    assert!(harness.core.is_leader_failed());
    assert_eq!(harness.core.to_view(), ViewNumber::new(1));
}

#[test]
fn report_block_is_idempotent() {
    let mut harness = Harness::new(0);
    let tip = harness.report_tip_9();
    assert_eq!(harness.core.consensus_height(), BlockHeight::new(10));

    harness.core.check_timeout();
    assert_eq!(harness.core.to_view(), ViewNumber::new(1));

    // Reporting the same tip again neither advances the cursor nor resets the in-progress view
    // change.
    harness.core.report_block(tip);
    assert_eq!(harness.core.consensus_height(), BlockHeight::new(10));
    assert_eq!(harness.core.view(), ViewNumber::new(0));
    assert_eq!(harness.core.to_view(), ViewNumber::new(1));
}

#[test]
fn prepare_contradicting_the_committed_checkpoint_is_rejected() {
    let mut harness = Harness::new(0);
    harness.report_tip_9();
    let (block, hash) = make_block(10, 2);

    let prepare = harness.prepare_from(1, 0, &block, hash);
    harness
        .core
        .handle_prepare(ReplicaIndex::new(1), harness.public(1), prepare, false)
        .unwrap();
    for idx in [2, 3] {
        let sign = harness.sign_from(idx, 0, hash);
        harness.core.handle_sign(harness.public(idx), sign).unwrap();
    }
    assert_eq!(harness.core.committed_prepare_height(), Some(BlockHeight::new(10)));

    // A different block for the committed height, even from the right primary, is refused.
    let (other_block, other_hash) = make_block(10, 3);
    let prepare = harness.prepare_from(1, 0, &other_block, other_hash);
    assert!(matches!(
        harness
            .core
            .handle_prepare(ReplicaIndex::new(1), harness.public(1), prepare, false),
        Err(ProtocolError::BlockMismatch)
    ));
}

#[test]
fn future_votes_are_cached_until_the_proposal_lands() {
    let mut harness = Harness::new(0);
    harness.report_tip_9();
    let (block, hash) = make_block(10, 2);

    // Sign votes for the block arrive before the proposal does.
    for idx in [2, 3] {
        let sign = harness.sign_from(idx, 0, hash);
        assert!(matches!(
            harness.core.handle_sign(harness.public(idx), sign),
            Err(ProtocolError::Future)
        ));
    }
    assert_eq!(harness.core.sign_count(&hash), 2);

    // The proposal lands; the two cached votes plus our own complete the quorum within the
    // prepare handler, and the commit phase begins.
    let prepare = harness.prepare_from(1, 0, &block, hash);
    harness
        .core
        .handle_prepare(ReplicaIndex::new(1), harness.public(1), prepare, false)
        .unwrap();
    assert_eq!(harness.core.sign_count(&hash), 3);
    assert!(harness.net.sent_kinds().contains(&MessageKind::Commit));
}

#[test]
fn laggard_view_change_gets_a_unicast_catch_up() {
    let mut harness = Harness::new(0);
    harness.report_tip_9();
    let tip_hash = CryptoHash::new([9; 32]);

    // Walk our own to_view up to 3.
    for _ in 0..3 {
        harness.core.check_timeout();
    }
    assert_eq!(harness.core.to_view(), ViewNumber::new(3));
    harness.net.clear_sent();

    // A peer announces view 1, far behind us and authored by itself: it gets our current view
    // change directly.
    let view_change = harness.view_change_from(2, 9, 1, tip_hash);
    harness
        .core
        .handle_view_change(ReplicaIndex::new(2), harness.public(2), view_change)
        .unwrap();

    let sent = harness.net.sent.lock().unwrap();
    let catch_up: Vec<_> = sent
        .iter()
        .filter(|(peer, msg)| {
            *peer == harness.public(2) && msg.kind() == MessageKind::ViewChange
        })
        .collect();
    assert_eq!(catch_up.len(), 1);
}
