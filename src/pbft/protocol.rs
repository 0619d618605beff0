/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Implementation of the PBFT state machine.
//!
//! [`Core`] is the single owner of all consensus state. The worker thread drives it exclusively:
//! inbound messages, host commands, and timer checks all arrive as calls on `&mut Core`, so the
//! handlers need no locking of their own. Each handler is straight-line code; the only I/O on a
//! handler's path is the checkpoint write in [`check_and_commit`](Core::check_and_commit) (which
//! must be durable before the commit vote leaves this node) and non-blocking sends into the
//! network provider's per-peer queues.
//!
//! ## The three phases
//!
//! For every height, the primary — `(view + chain tip) mod N` — broadcasts a [`Prepare`] carrying
//! the proposed block. Every miner re-executes the block locally, votes over the hash of the
//! block *it* produced by broadcasting a [`Sign`], and counts sign votes. At quorum it persists
//! the proposal as the committed-prepare checkpoint and broadcasts a [`Commit`]; at a quorum of
//! commits it seals the block with the collected commit signatures and emits it. A view change
//! replaces the primary whenever the current one is suspected.

use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};
use std::sync::mpsc::Sender;
use std::time::{Instant, SystemTime};

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::VerifyingKey;

use crate::backup::{BackupStore, COMMITTED_KEY};
use crate::chain::{Chain, ChainError};
use crate::config::Configuration;
use crate::events::*;
use crate::networking::network::PeerNetwork;
use crate::networking::sending::Broadcaster;
use crate::roster::{self, AccountType, Roster};
use crate::types::{
    basic::{BlockHeight, CryptoHash, ReplicaIndex, Timestamp, ViewNumber},
    block::{BlockSummary, SealedBlock},
    keypair::Keypair,
};

use super::caches::{ViewChangeCache, VoteCache};
use super::messages::{Commit, ConsensusMessage, Prepare, Sign, SignedMessage, ViewChange};

/// Why a handler refused a message or a host command could not be served.
///
/// `Stale`, `Future`, and `Duplicate` are everyday noise and are logged at debug level by the
/// worker; the remaining kinds indicate misconfiguration or a misbehaving peer and are logged as
/// warnings. None of them terminate the worker loop.
#[derive(Debug)]
pub enum ProtocolError {
    /// The roster does not recognize this node, or its miner bookkeeping is inconsistent.
    Config,
    /// `sig` or `sig2` failed to verify against the sender's public key.
    BadSignature,
    /// Height or view below the current slot.
    Stale,
    /// Height or view above the current slot; the message was parked for later if it qualified.
    Future,
    /// The message's fingerprint or signer slot is already occupied.
    Duplicate,
    /// A proposal from a node that is not the computed primary.
    WrongLeader,
    /// The proposal contradicts executed or committed state.
    BlockMismatch,
    /// The chain rejected the proposed block.
    Execution(ChainError),
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Config => write!(f, "node is not correctly configured in the roster"),
            ProtocolError::BadSignature => write!(f, "signature verification failed"),
            ProtocolError::Stale => write!(f, "message below the current height or view"),
            ProtocolError::Future => write!(f, "message above the current height or view"),
            ProtocolError::Duplicate => write!(f, "message already seen"),
            ProtocolError::WrongLeader => write!(f, "proposal from a non-primary node"),
            ProtocolError::BlockMismatch => write!(f, "block contradicts executed or committed state"),
            ProtocolError::Execution(err) => write!(f, "block execution failed: {}", err),
        }
    }
}

impl ProtocolError {
    /// Whether this kind is routine traffic rather than a sign of misbehavior.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            ProtocolError::Stale | ProtocolError::Future | ProtocolError::Duplicate
        )
    }
}

/// The PBFT state machine. Owned and driven exclusively by the worker thread.
pub(crate) struct Core<N: PeerNetwork, R: Roster, C: Chain, B: BackupStore> {
    config: Configuration,
    keypair: Keypair,
    roster: R,
    chain: C,
    backup: B,
    broadcaster: Broadcaster<N, R>,
    event_publisher: Option<Sender<Event>>,

    // Roster-derived configuration, refreshed by `reset_config`.
    cfg_err: bool,
    account_type: Option<AccountType>,
    self_idx: ReplicaIndex,
    node_count: u64,

    // Slot state.
    highest_block: Option<BlockSummary>,
    consensus_height: BlockHeight,
    view: ViewNumber,
    to_view: ViewNumber,
    change_cycle: u32,
    leader_failed: bool,
    empty_block_flag: bool,

    // Timeout anchors and garbage-collection clock.
    last_consensus_time: Timestamp,
    last_sign_time: Timestamp,
    last_collect_time: Instant,

    // Caches.
    raw_prepare: Option<Prepare>,
    prepare: Option<Prepare>,
    sign_cache: VoteCache<Sign>,
    commit_cache: VoteCache<Commit>,
    view_change_cache: ViewChangeCache,
    committed_prepare: Option<Prepare>,
    future_prepare: Option<(ReplicaIndex, Prepare)>,
    commit_triggered: HashSet<CryptoHash>,
}

impl<N: PeerNetwork, R: Roster, C: Chain, B: BackupStore> Core<N, R, C, B> {
    /// Create a core, restoring the committed-prepare checkpoint from the backup store. The state
    /// machine is inert until the first [`report_block`](Core::report_block) tells it the chain
    /// tip.
    pub(crate) fn new(
        config: Configuration,
        keypair: Keypair,
        roster: R,
        chain: C,
        backup: B,
        broadcaster: Broadcaster<N, R>,
        event_publisher: Option<Sender<Event>>,
    ) -> Core<N, R, C, B> {
        let committed_prepare = backup.get(COMMITTED_KEY).and_then(|bytes| {
            match Prepare::deserialize(&mut bytes.as_slice()) {
                Ok(prepare) => {
                    log::info!(
                        "restored committed prepare: height={}, view={}",
                        prepare.height,
                        prepare.view
                    );
                    Some(prepare)
                }
                Err(err) => {
                    log::warn!("could not decode the committed-prepare checkpoint: {}", err);
                    None
                }
            }
        });

        let mut core = Core {
            config,
            keypair,
            roster,
            chain,
            backup,
            broadcaster,
            event_publisher,
            cfg_err: true,
            account_type: None,
            self_idx: ReplicaIndex::new(0),
            node_count: 0,
            highest_block: None,
            consensus_height: BlockHeight::new(0),
            view: ViewNumber::init(),
            to_view: ViewNumber::init(),
            change_cycle: 0,
            leader_failed: false,
            empty_block_flag: false,
            last_consensus_time: Timestamp::now(),
            last_sign_time: Timestamp::ZERO,
            last_collect_time: Instant::now(),
            raw_prepare: None,
            prepare: None,
            sign_cache: VoteCache::new(),
            commit_cache: VoteCache::new(),
            view_change_cache: ViewChangeCache::new(),
            committed_prepare,
            future_prepare: None,
            commit_triggered: HashSet::new(),
        };
        core.reset_config();
        core
    }

    /// Re-read the roster-derived configuration: our account type and index, and the miner count.
    /// Any failure closes the sealing gate (`cfg_err`) without stopping the engine; an index or
    /// count change invalidates every in-flight vote.
    pub(crate) fn reset_config(&mut self) {
        let own_key = self.keypair.public();

        let account_type = match self.roster.account_type(&own_key) {
            Some(account_type) => account_type,
            None => {
                log::warn!("reset_config: cannot find own key in the roster, sealing disabled");
                self.cfg_err = true;
                return;
            }
        };
        self.account_type = Some(account_type);

        let node_count = self.roster.miner_count();
        if node_count == 0 {
            log::warn!("reset_config: miner count is 0, sealing disabled");
            self.cfg_err = true;
            return;
        }

        let self_idx = match self.roster.index_of(&own_key) {
            Some(idx) => idx,
            None => {
                if account_type == AccountType::Miner {
                    log::warn!("reset_config: no roster index for own key, sealing disabled");
                    self.cfg_err = true;
                    return;
                }
                ReplicaIndex::new(0)
            }
        };

        if node_count != self.node_count || self_idx != self.self_idx {
            self.node_count = node_count;
            self.self_idx = self_idx;

            self.prepare = None;
            self.sign_cache.clear();
            self.commit_cache.clear();
            self.view_change_cache = ViewChangeCache::new();
            self.commit_triggered.clear();

            match self.roster.miner_list(self.chain_tip_height()) {
                Some(miner_list) if miner_list.len() as u64 == node_count => (),
                Some(miner_list) => {
                    log::warn!(
                        "reset_config: miner list size {} does not match miner count {}",
                        miner_list.len(),
                        node_count
                    );
                    self.cfg_err = true;
                    return;
                }
                None => {
                    log::warn!("reset_config: no miner list for the current tip");
                    self.cfg_err = true;
                    return;
                }
            }
            log::info!(
                "reset_config: self_idx={}, node_count={}",
                self.self_idx,
                self.node_count
            );
        }

        self.cfg_err = false;
    }

    fn quorum(&self) -> u64 {
        roster::quorum(self.node_count)
    }

    fn max_faulty(&self) -> u64 {
        roster::max_faulty(self.node_count)
    }

    fn is_miner(&self) -> bool {
        self.account_type == Some(AccountType::Miner)
    }

    fn chain_tip_height(&self) -> BlockHeight {
        self.highest_block
            .as_ref()
            .map_or(BlockHeight::new(0), |tip| tip.height)
    }

    /// The primary for the current slot, or `None` while the node is misconfigured, the leader is
    /// already suspected, or no chain tip has been reported yet.
    fn leader(&self) -> Option<ReplicaIndex> {
        if self.cfg_err || self.leader_failed {
            return None;
        }
        let tip = self.highest_block.as_ref()?;
        Some(ReplicaIndex::new(
            (self.view.int() + tip.height.int()) % self.node_count,
        ))
    }

    /// The sealing gate. Returns true iff this node should build and propose a block for the
    /// current slot.
    ///
    /// Side effects: if the elected primary is a known but disconnected peer, zero the timeout
    /// anchors so the next timeout check starts a view change immediately; if a committed-prepare
    /// checkpoint exists for the current height, replay it instead of allowing a fresh proposal.
    pub(crate) fn should_seal(&mut self) -> bool {
        if self.cfg_err || !self.is_miner() {
            return false;
        }

        let leader = match self.leader() {
            Some(leader) => leader,
            None => return false,
        };

        if leader != self.self_idx {
            if let Some(leader_key) = self.roster.public_key(leader) {
                if !self.broadcaster.is_connected(&leader_key) {
                    log::warn!(
                        "elected primary {} is disconnected, forcing a view change",
                        leader
                    );
                    self.last_consensus_time = Timestamp::ZERO;
                    self.last_sign_time = Timestamp::ZERO;
                }
            }
            return false;
        }

        // A saved committed-prepare for the current height takes precedence over sealing a new
        // block: the network may already have signed it.
        let saved = match &self.committed_prepare {
            Some(committed) if committed.height == self.consensus_height => Some(committed.clone()),
            _ => None,
        };
        if let Some(saved) = saved {
            let raw_matches = self
                .raw_prepare
                .as_ref()
                .is_some_and(|raw| raw.height == self.consensus_height);
            if !raw_matches {
                self.rehandle_prepare(saved);
            }
            return false;
        }

        true
    }

    /// Replay a committed-but-unsaved proposal under the current view. The peer-seen masks are
    /// cleared first: the network has seen these bytes before and would otherwise suppress them.
    fn rehandle_prepare(&mut self, saved: Prepare) {
        log::info!(
            "found a committed but unsaved block, posting it out again: height={}",
            saved.height
        );

        self.broadcaster.clear_mask();

        let req = Prepare::new(
            &self.keypair,
            saved.height,
            self.view,
            self.self_idx,
            saved.block_hash,
            saved.block,
        );

        self.broadcaster
            .broadcast(&req.clone().into(), &HashSet::new());

        let own_key = self.keypair.public();
        if let Err(err) = self.handle_prepare(self.self_idx, own_key, req, true) {
            log::warn!("replay of the committed prepare was not accepted: {}", err);
        }
    }

    /// The primary proposes: broadcast a `Prepare` over the host-built block and remember it as
    /// the raw prepare. Returns the view the proposal was made under; the host passes it back to
    /// [`generate_commit`](Core::generate_commit) after executing the block.
    pub(crate) fn generate_seal(
        &mut self,
        header: &BlockSummary,
        block: &[u8],
    ) -> Result<ViewNumber, ProtocolError> {
        if self.cfg_err {
            return Err(ProtocolError::Config);
        }
        let view = self.view;

        let req = Prepare::new(
            &self.keypair,
            header.height,
            view,
            self.self_idx,
            header.hash,
            block.to_vec(),
        );

        self.broadcaster
            .broadcast(&req.clone().into(), &HashSet::new());
        self.add_raw_prepare(req.clone());

        Event::Propose(ProposeEvent {
            timestamp: SystemTime::now(),
            prepare: req,
        })
        .publish(&self.event_publisher);

        Ok(view)
    }

    /// The primary (or a single-node network) enters the sign phase for its own executed block:
    /// store it as the accepted proposal, broadcast the sign vote, and check for quorum.
    pub(crate) fn generate_commit(
        &mut self,
        header: &BlockSummary,
        block: &[u8],
        view: ViewNumber,
    ) -> Result<(), ProtocolError> {
        if view != self.view {
            log::info!(
                "view changed while executing own proposal: proposed under {}, now {}",
                view,
                self.view
            );
            return Err(ProtocolError::Stale);
        }

        let req = Prepare::new(
            &self.keypair,
            header.height,
            view,
            self.self_idx,
            header.hash,
            block.to_vec(),
        );

        self.add_prepare(req.clone());
        self.broadcast_sign(&req);
        self.check_and_commit();
        Ok(())
    }

    /// Handle an inbound `Prepare`. `from` is the roster index of the relaying peer; `origin` its
    /// public key; `self_originated` marks the replay path, which feeds our own proposal back
    /// through this handler.
    pub(crate) fn handle_prepare(
        &mut self,
        from: ReplicaIndex,
        origin: VerifyingKey,
        req: Prepare,
        self_originated: bool,
    ) -> Result<(), ProtocolError> {
        if self
            .raw_prepare
            .as_ref()
            .is_some_and(|raw| raw.block_hash == req.block_hash)
        {
            return Err(ProtocolError::Duplicate);
        }

        if !self_originated && req.idx == self.self_idx {
            return Err(ProtocolError::Duplicate);
        }

        if req.height < self.consensus_height || req.view < self.view {
            return Err(ProtocolError::Stale);
        }

        if req.height > self.consensus_height || req.view > self.view {
            self.recv_future_block(from, req);
            return Err(ProtocolError::Future);
        }

        match self.leader() {
            Some(leader) if leader == req.idx => (),
            _ => return Err(ProtocolError::WrongLeader),
        }

        if let Some(committed) = &self.committed_prepare {
            if req.height == committed.height && req.block_hash != committed.block_hash {
                log::info!(
                    "proposal for height {} contradicts the committed prepare, discarding",
                    req.height
                );
                return Err(ProtocolError::BlockMismatch);
            }
        }

        if !self.check_sign(&req) {
            return Err(ProtocolError::BadSignature);
        }

        // Order matters: storing the raw prepare clears the accepted proposal, so the contradicts-
        // committed check and the future check must both have passed already.
        self.add_raw_prepare(req.clone());

        let executed = self
            .chain
            .check_block_valid(&req.block_hash, &req.block)
            .map_err(ProtocolError::Execution)?;
        if executed.received_hash != req.block_hash {
            log::warn!("block data does not hash to the proposed hash, discarding");
            return Err(ProtocolError::BlockMismatch);
        }

        if executed.transaction_count == 0 && self.config.omit_empty_block {
            self.change_view_for_empty_block();
            return Ok(());
        }

        self.chain.add_block_cache(&executed);

        // Rebuild the proposal over the locally executed block. The primary's index is preserved
        // so it remains the author of record; the hash may differ from the proposed one.
        let executed_req = Prepare::new(
            &self.keypair,
            req.height,
            req.view,
            req.idx,
            executed.header.hash,
            executed.block,
        );

        self.add_prepare(executed_req.clone());

        Event::ReceivePrepare(ReceivePrepareEvent {
            timestamp: SystemTime::now(),
            origin,
            prepare: req,
        })
        .publish(&self.event_publisher);

        if self.is_miner() {
            self.broadcast_sign(&executed_req);
        }

        self.check_and_commit();
        Ok(())
    }

    /// Handle an inbound `Sign` vote.
    pub(crate) fn handle_sign(
        &mut self,
        origin: VerifyingKey,
        req: Sign,
    ) -> Result<(), ProtocolError> {
        if self.sign_cache.contains(&req) {
            return Err(ProtocolError::Duplicate);
        }

        if req.idx == self.self_idx {
            return Err(ProtocolError::Duplicate);
        }

        let prepare_hash = self.prepare.as_ref().map(|p| p.block_hash);
        if prepare_hash != Some(req.block_hash) {
            // Not a vote for the proposal we accepted. If it is plausibly for an upcoming slot,
            // park it in the cache so `check_and_commit` finds it once the proposal lands.
            let future = req.height >= self.consensus_height || req.view > self.view;
            if future && self.check_sign(&req) {
                self.sign_cache.insert(req);
                return Err(ProtocolError::Future);
            }
            return Err(ProtocolError::Stale);
        }

        if self.prepare.as_ref().is_some_and(|p| p.view != req.view) {
            return Err(ProtocolError::Stale);
        }

        if !self.check_sign(&req) {
            return Err(ProtocolError::BadSignature);
        }

        Event::ReceiveSign(ReceiveSignEvent {
            timestamp: SystemTime::now(),
            origin,
            sign: req.clone(),
        })
        .publish(&self.event_publisher);

        self.sign_cache.insert(req);
        self.check_and_commit();
        Ok(())
    }

    /// Handle an inbound `Commit` vote. Mirrors [`handle_sign`](Core::handle_sign), including the
    /// future-caching behavior.
    pub(crate) fn handle_commit(
        &mut self,
        origin: VerifyingKey,
        req: Commit,
    ) -> Result<(), ProtocolError> {
        if self.commit_cache.contains(&req) {
            return Err(ProtocolError::Duplicate);
        }

        if req.idx == self.self_idx {
            return Err(ProtocolError::Duplicate);
        }

        let prepare_hash = self.prepare.as_ref().map(|p| p.block_hash);
        if prepare_hash != Some(req.block_hash) {
            let future = req.height >= self.consensus_height || req.view > self.view;
            if future && self.check_sign(&req) {
                self.commit_cache.insert(req);
                return Err(ProtocolError::Future);
            }
            return Err(ProtocolError::Stale);
        }

        if self.prepare.as_ref().is_some_and(|p| p.view != req.view) {
            return Err(ProtocolError::Stale);
        }

        if !self.check_sign(&req) {
            return Err(ProtocolError::BadSignature);
        }

        Event::ReceiveCommit(ReceiveCommitEvent {
            timestamp: SystemTime::now(),
            origin,
            commit: req.clone(),
        })
        .publish(&self.event_publisher);

        self.commit_cache.insert(req);
        self.check_and_save();
        Ok(())
    }

    /// Handle an inbound `ViewChange`.
    pub(crate) fn handle_view_change(
        &mut self,
        from: ReplicaIndex,
        origin: VerifyingKey,
        req: ViewChange,
    ) -> Result<(), ProtocolError> {
        if self.view_change_cache.contains(req.view, req.idx) {
            return Err(ProtocolError::Duplicate);
        }

        if req.idx == self.self_idx {
            return Err(ProtocolError::Duplicate);
        }

        // A peer whose proposed view lags ours by more than one restarted while the rest of the
        // network moved on. Send it our own view change directly so it can catch up; the `+ 1`
        // spares peers that are merely one tick behind from the extra traffic.
        if req.view + 1 < self.to_view && req.idx == from {
            if self.is_miner() {
                if let Some(tip) = &self.highest_block {
                    let catch_up = ViewChange::new(
                        &self.keypair,
                        tip.height,
                        self.to_view,
                        self.self_idx,
                        tip.hash,
                    );
                    self.broadcaster.unicast(&origin, catch_up.into());
                }
            }
        }

        let tip = match &self.highest_block {
            Some(tip) => tip.clone(),
            None => return Err(ProtocolError::Stale),
        };

        if req.height < tip.height || req.view <= self.view {
            return Err(ProtocolError::Stale);
        }

        if req.height == tip.height
            && req.block_hash != tip.hash
            && self.chain.block(&req.block_hash).is_none()
        {
            log::info!(
                "view change at tip height {} names a forked hash, discarding",
                tip.height
            );
            return Err(ProtocolError::BlockMismatch);
        }

        if !self.check_sign(&req) {
            return Err(ProtocolError::BadSignature);
        }

        Event::ReceiveViewChange(ReceiveViewChangeEvent {
            timestamp: SystemTime::now(),
            origin,
            view_change: req.clone(),
        })
        .publish(&self.event_publisher);

        let req_view = req.view;
        self.view_change_cache.insert(req);

        if req_view == self.to_view {
            self.check_and_change_view();
        } else if let Some(ahead) = self.view_change_cache.ahead_of(self.to_view, tip.height) {
            // More than f miners are already past our proposed view, so waiting out our own timer
            // cannot succeed. Do not jump while this node alone still has an unsaved block at the
            // committed height: broadcasting a view change too early would be discarded by peers
            // whose view is higher, stranding the block.
            let holding_committed_block = ahead.min_height == self.consensus_height
                && self
                    .committed_prepare
                    .as_ref()
                    .is_some_and(|committed| committed.height == ahead.min_height);
            if ahead.signers > self.max_faulty() && !holding_committed_block {
                log::info!(
                    "fast view change: to_view={}, min_view={}",
                    self.to_view,
                    ahead.min_view
                );
                self.last_consensus_time = Timestamp::ZERO;
                self.last_sign_time = Timestamp::ZERO;
                // One short of the target: the next timeout tick increments `to_view` to
                // `min_view` and completes the change through the normal path.
                self.to_view = ahead.min_view - 1;
                self.change_cycle =
                    (self.to_view.int().min(self.config.max_change_cycle as u64)) as u32;
            }
        }

        Ok(())
    }

    /// Phase 2 → 3 transition: on reaching the sign quorum, persist the checkpoint and broadcast
    /// our commit vote. Triggers exactly once per proposal, on the vote that completes the
    /// quorum.
    fn check_and_commit(&mut self) {
        let prepare = match &self.prepare {
            Some(prepare) => prepare.clone(),
            None => return,
        };

        let have_sign = self.sign_cache.count(&prepare.block_hash);
        if have_sign != self.quorum() {
            return;
        }
        log::info!(
            "reached sign quorum for height={}, have_sign={}",
            prepare.height,
            have_sign
        );

        if prepare.view != self.view {
            log::info!(
                "view changed while collecting signs, discarding: prepare.view={}, view={}",
                prepare.view,
                self.view
            );
            return;
        }

        if let Some(raw) = self.raw_prepare.clone() {
            self.committed_prepare = Some(raw.clone());
            self.backup_committed(raw);
        }

        if self.is_miner() {
            let commit = Commit::new(
                &self.keypair,
                prepare.height,
                prepare.view,
                self.self_idx,
                prepare.block_hash,
            );
            self.broadcaster
                .broadcast(&commit.clone().into(), &HashSet::new());
            self.commit_cache.insert(commit.clone());
            Event::CommitVote(CommitVoteEvent {
                timestamp: SystemTime::now(),
                commit,
            })
            .publish(&self.event_publisher);
        }

        // Fresh anchor: collecting commit votes deserves a full timeout interval of its own.
        self.last_sign_time = Timestamp::now();

        self.check_and_save();
    }

    /// Finalisation: with both quorums in hand, seal the block with every collected commit
    /// signature and emit it. At most one emission per block hash.
    fn check_and_save(&mut self) {
        let prepare = match &self.prepare {
            Some(prepare) => prepare.clone(),
            None => return,
        };

        let have_sign = self.sign_cache.count(&prepare.block_hash);
        let have_commit = self.commit_cache.count(&prepare.block_hash);
        if have_sign < self.quorum()
            || have_commit < self.quorum()
            || self.commit_triggered.contains(&prepare.block_hash)
        {
            return;
        }
        self.commit_triggered.insert(prepare.block_hash);
        log::info!(
            "reached commit quorum for height={}, have_sign={}, have_commit={}",
            prepare.height,
            have_sign,
            have_commit
        );

        if prepare.view != self.view {
            log::info!(
                "view changed while collecting commits, discarding: prepare.view={}, view={}",
                prepare.view,
                self.view
            );
            return;
        }

        if prepare.height <= self.chain_tip_height() {
            log::info!(
                "block at height {} is not beyond the chain tip {}, discarding",
                prepare.height,
                self.chain_tip_height()
            );
            return;
        }

        // The certificate carries every commit vote we collected, not just a quorum of them.
        let mut signatures: Vec<_> = self
            .commit_cache
            .votes(&prepare.block_hash)
            .map(|commit| (commit.idx, commit.sig))
            .collect();
        signatures.sort_by_key(|(idx, _)| *idx);

        let sealed = SealedBlock {
            block: prepare.block.clone(),
            signatures,
        };

        Event::SealGenerated(SealGeneratedEvent {
            timestamp: SystemTime::now(),
            height: prepare.height,
            block_hash: prepare.block_hash,
            block: sealed,
            is_primary: prepare.idx == self.self_idx,
        })
        .publish(&self.event_publisher);
    }

    /// Check whether the current slot has outlived its timeout, and if so start (or continue) a
    /// view change. Invoked on every worker iteration.
    pub(crate) fn check_timeout(&mut self) {
        if self.highest_block.is_none() {
            return;
        }

        let now = Timestamp::now();
        let anchor = self.last_consensus_time.max(self.last_sign_time);
        let interval =
            (self.config.view_timeout.as_millis() as f64 * 1.5f64.powi(self.change_cycle as i32))
                as u64;
        if now.since(anchor) < interval {
            return;
        }

        self.leader_failed = true;
        self.to_view = self.to_view + 1;
        self.change_cycle = (self.change_cycle + 1).min(self.config.max_change_cycle);
        self.last_consensus_time = now;

        let tip = self.highest_block.as_ref().expect("checked above").clone();
        self.view_change_cache
            .purge_conflicting_at(self.to_view, tip.height, &tip.hash);

        log::info!(
            "view timeout: height={}, view={}, to_view={}, change_cycle={}",
            tip.height,
            self.view,
            self.to_view,
            self.change_cycle
        );
        Event::ViewTimeout(ViewTimeoutEvent {
            timestamp: SystemTime::now(),
            view: self.view,
            to_view: self.to_view,
            change_cycle: self.change_cycle,
        })
        .publish(&self.event_publisher);

        self.broadcast_view_change();
        self.check_and_change_view();
    }

    /// Enter `to_view` once a quorum of the network wants it. The count treats our own pending
    /// view change as implicit, hence `quorum − 1`.
    fn check_and_change_view(&mut self) {
        if self.view_change_cache.count_at(self.to_view) < self.quorum().saturating_sub(1) {
            return;
        }

        log::info!("view change complete: entering view {}", self.to_view);

        let old_view = self.view;
        self.leader_failed = false;
        self.view = self.to_view;

        self.raw_prepare = None;
        self.prepare = None;
        self.sign_cache.clear();
        self.commit_cache.clear();
        self.commit_triggered.clear();
        self.view_change_cache.purge_through(self.view);
        // The peer-seen masks stay: wiping them here would flood the network with replays of old
        // messages.

        Event::AdvanceView(AdvanceViewEvent {
            timestamp: SystemTime::now(),
            old_view,
            new_view: self.view,
        })
        .publish(&self.event_publisher);
    }

    /// Chain advancement callback. Idempotent: reporting the same tip again changes nothing.
    pub(crate) fn report_block(&mut self, header: BlockSummary) {
        let reported_height = header.height;
        self.highest_block = Some(header.clone());

        if reported_height >= self.consensus_height {
            self.view = ViewNumber::init();
            self.to_view = ViewNumber::init();
            self.change_cycle = 0;
            self.leader_failed = false;
            self.last_consensus_time = Timestamp::now();
            self.consensus_height = reported_height + 1;
            // View changes naming the new tip survive; everything else in the cache is now moot.
            self.view_change_cache
                .purge_conflicting(header.height, &header.hash);
        }

        self.reset_config();
        self.drop_block_caches(&header.hash);

        log::info!(
            "chain reported block: height={}, next consensus height={}",
            reported_height,
            self.consensus_height
        );
        Event::ReportBlock(ReportBlockEvent {
            timestamp: SystemTime::now(),
            height: reported_height,
            next_height: self.consensus_height,
        })
        .publish(&self.event_publisher);
    }

    /// Drain the future-proposal slot if it has become current, and drop it if it has gone stale.
    pub(crate) fn handle_future_block(&mut self) {
        let matches_slot = self.future_prepare.as_ref().is_some_and(|(_, prepare)| {
            prepare.height == self.consensus_height && prepare.view == self.view
        });
        let stale = self.future_prepare.as_ref().is_some_and(|(_, prepare)| {
            prepare.height < self.consensus_height
                || (prepare.height == self.consensus_height && prepare.view < self.view)
        });

        if stale {
            self.future_prepare = None;
            return;
        }
        if !matches_slot {
            return;
        }

        let (from, prepare) = self.future_prepare.take().expect("checked above");
        log::info!("handling parked future proposal: height={}", prepare.height);
        let origin = self
            .roster
            .public_key(from)
            .unwrap_or_else(|| self.keypair.public());
        if let Err(err) = self.handle_prepare(from, origin, prepare, false) {
            if err.is_benign() {
                log::debug!("parked future proposal not accepted: {}", err);
            } else {
                log::warn!("parked future proposal not accepted: {}", err);
            }
        }
    }

    /// Prune vote-cache entries below the chain tip. Runs at most once per collect interval.
    pub(crate) fn collect_garbage(&mut self) {
        if self.highest_block.is_none() {
            return;
        }
        if self.last_collect_time.elapsed() < self.config.collect_interval {
            return;
        }

        let tip_height = self.chain_tip_height();
        for hash in self.sign_cache.prune_below(tip_height) {
            self.commit_triggered.remove(&hash);
        }
        self.commit_cache.prune_below(tip_height);
        self.last_collect_time = Instant::now();
    }

    /// Relay an accepted peer message to the other miners, excluding the relaying peer and the
    /// claimed author. Gated so that ancient replays do not circulate.
    pub(crate) fn maybe_rebroadcast(
        &mut self,
        origin: &VerifyingKey,
        from: ReplicaIndex,
        msg: &ConsensusMessage,
    ) {
        if msg.idx() != from {
            return;
        }

        let tip_height = self.chain_tip_height();
        let height_ok = msg.height() > tip_height
            || tip_height - msg.height() < self.config.rebroadcast_height_window;
        if !height_ok {
            return;
        }

        if let Some(window) = self.config.rebroadcast_time_window {
            let age = Timestamp::now().since(self.msg_timestamp(msg));
            if age >= window.as_millis() as u64 {
                return;
            }
        }

        let mut exclude = HashSet::from([*origin]);
        if let Some(author) = self.roster.public_key(msg.idx()) {
            exclude.insert(author);
        }
        self.broadcaster.broadcast(msg, &exclude);
    }

    fn msg_timestamp(&self, msg: &ConsensusMessage) -> Timestamp {
        match msg {
            ConsensusMessage::Prepare(m) => m.timestamp,
            ConsensusMessage::Sign(m) => m.timestamp,
            ConsensusMessage::Commit(m) => m.timestamp,
            ConsensusMessage::ViewChange(m) => m.timestamp,
        }
    }

    /// Empty-block view change: zero the anchors so the timeout fires immediately, reset the
    /// back-off, and mark the leader failed so this node does not re-elect it meanwhile.
    fn change_view_for_empty_block(&mut self) {
        log::info!(
            "empty block proposed at height {}, handing the slot over",
            self.consensus_height
        );
        self.last_consensus_time = Timestamp::ZERO;
        self.last_sign_time = Timestamp::ZERO;
        self.change_cycle = 0;
        self.empty_block_flag = true;
        self.leader_failed = true;
    }

    /// Invoked by the host after its own `generate_seal` produced an empty block. Same effect as
    /// the acceptor-side empty-block path.
    pub(crate) fn change_view_for_empty_block_by_host(&mut self) {
        self.change_view_for_empty_block();
    }

    fn broadcast_view_change(&mut self) {
        if !self.is_miner() {
            return;
        }
        let tip = match &self.highest_block {
            Some(tip) => tip.clone(),
            None => return,
        };

        if !self.empty_block_flag {
            log::warn!(
                "broadcasting view change: height={}, to_view={}",
                tip.height,
                self.to_view
            );
        }
        self.empty_block_flag = false;

        let req = ViewChange::new(
            &self.keypair,
            tip.height,
            self.to_view,
            self.self_idx,
            tip.hash,
        );
        self.broadcaster
            .broadcast(&req.clone().into(), &HashSet::new());

        Event::ViewChangeVote(ViewChangeVoteEvent {
            timestamp: SystemTime::now(),
            view_change: req,
        })
        .publish(&self.event_publisher);
    }

    fn broadcast_sign(&mut self, prepare: &Prepare) {
        let sign = Sign::new(
            &self.keypair,
            prepare.height,
            prepare.view,
            self.self_idx,
            prepare.block_hash,
        );
        self.broadcaster
            .broadcast(&sign.clone().into(), &HashSet::new());
        self.sign_cache.insert(sign.clone());

        Event::SignVote(SignVoteEvent {
            timestamp: SystemTime::now(),
            sign,
        })
        .publish(&self.event_publisher);
    }

    /// Store a freshly received proposal. A new raw prepare invalidates any accepted proposal:
    /// if this node is in the sign phase, the new proposal restarts the flow, while a node that
    /// already holds a committed prepare never reaches this point for a conflicting hash.
    fn add_raw_prepare(&mut self, req: Prepare) {
        self.raw_prepare = Some(req);
        self.prepare = None;
    }

    /// Store the locally executed form of the proposal, and drop phase votes for its hash that
    /// were cast under a different view.
    fn add_prepare(&mut self, req: Prepare) {
        self.sign_cache.retain_view(&req.block_hash, req.view);
        self.commit_cache.retain_view(&req.block_hash, req.view);
        self.prepare = Some(req);
    }

    fn drop_block_caches(&mut self, hash: &CryptoHash) {
        self.sign_cache.remove(hash);
        self.commit_cache.remove(hash);
        self.commit_triggered.remove(hash);
        if self.prepare.as_ref().is_some_and(|p| p.block_hash == *hash) {
            self.prepare = None;
        }
    }

    fn backup_committed(&mut self, committed: Prepare) {
        let bytes = match committed.try_to_vec() {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("could not encode the committed prepare: {}", err);
                return;
            }
        };
        // A failed write is logged but does not abort the commit path: after a crash the chain
        // layer re-runs consensus for the height instead of recovering from the checkpoint.
        if let Err(err) = self.backup.set(COMMITTED_KEY, &bytes) {
            log::warn!("could not persist the committed prepare: {}", err);
            return;
        }

        Event::BackupCheckpoint(BackupCheckpointEvent {
            timestamp: SystemTime::now(),
            height: committed.height,
            block_hash: committed.block_hash,
        })
        .publish(&self.event_publisher);
    }

    fn recv_future_block(&mut self, from: ReplicaIndex, req: Prepare) {
        let same_hash = self
            .future_prepare
            .as_ref()
            .is_some_and(|(_, parked)| parked.block_hash == req.block_hash);
        if !same_hash {
            log::info!(
                "parking future proposal: height={}, view={}, idx={}",
                req.height,
                req.view,
                req.idx
            );
            self.future_prepare = Some((from, req));
        }
    }

    fn check_sign<M: SignedMessage>(&self, msg: &M) -> bool {
        match self.roster.public_key(msg.idx()) {
            Some(pk) => msg.is_correct(&pk),
            None => {
                log::warn!("no public key in the roster for index {}", msg.idx());
                false
            }
        }
    }
}

#[cfg(test)]
impl<N: PeerNetwork, R: Roster, C: Chain, B: BackupStore> Core<N, R, C, B> {
    pub(crate) fn view(&self) -> ViewNumber {
        self.view
    }

    pub(crate) fn to_view(&self) -> ViewNumber {
        self.to_view
    }

    pub(crate) fn consensus_height(&self) -> BlockHeight {
        self.consensus_height
    }

    pub(crate) fn is_leader_failed(&self) -> bool {
        self.leader_failed
    }

    pub(crate) fn committed_prepare_height(&self) -> Option<BlockHeight> {
        self.committed_prepare.as_ref().map(|p| p.height)
    }

    pub(crate) fn has_future_prepare(&self) -> bool {
        self.future_prepare.is_some()
    }

    pub(crate) fn sign_count(&self, hash: &CryptoHash) -> u64 {
        self.sign_cache.count(hash)
    }
}
