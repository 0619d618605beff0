/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Notifications that are emitted when significant things happen in the local replica.
//!
//! ## Event enum
//!
//! Significant occurrences in the replica include broadcasting a proposal, casting a phase vote,
//! persisting the committed-prepare checkpoint, and above all emitting a sealed block. Each of
//! these corresponds to a variant of the [`Event`] enum, whose inner struct carries a timestamp
//! taken when the occurrence completed, plus whatever summarizes it.
//!
//! ## Registering event handlers
//!
//! The host registers handler closures when building the replica; the event-bus thread calls them
//! whenever the matching variant is published. The handler for [`SealGeneratedEvent`] is how a
//! host receives finished blocks: there is no other channel through which sealed blocks leave the
//! engine.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use ed25519_dalek::VerifyingKey;

use crate::pbft::messages::{Commit, Prepare, Sign, ViewChange};
use crate::types::{
    basic::{BlockHeight, CryptoHash, ViewNumber},
    block::SealedBlock,
};

/// Enumerates all events defined for the engine.
pub enum Event {
    // Three-phase progress events.
    Propose(ProposeEvent),
    ReceivePrepare(ReceivePrepareEvent),
    SignVote(SignVoteEvent),
    ReceiveSign(ReceiveSignEvent),
    CommitVote(CommitVoteEvent),
    ReceiveCommit(ReceiveCommitEvent),

    // View-change subprotocol events.
    ViewChangeVote(ViewChangeVoteEvent),
    ReceiveViewChange(ReceiveViewChangeEvent),
    ViewTimeout(ViewTimeoutEvent),
    AdvanceView(AdvanceViewEvent),

    // Events that change persistent or chain-visible state.
    BackupCheckpoint(BackupCheckpointEvent),
    SealGenerated(SealGeneratedEvent),
    ReportBlock(ReportBlockEvent),
}

impl Event {
    /// Publish this event on the event publisher channel, if one is defined.
    pub(crate) fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// The replica proposed a block by broadcasting a [`Prepare`] to all miners.
pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub prepare: Prepare,
}

/// The replica received a proposal from a peer.
pub struct ReceivePrepareEvent {
    pub timestamp: SystemTime,
    pub origin: VerifyingKey,
    pub prepare: Prepare,
}

/// The replica voted for a block in the sign phase by broadcasting a [`Sign`].
pub struct SignVoteEvent {
    pub timestamp: SystemTime,
    pub sign: Sign,
}

/// The replica received a sign vote from a peer.
pub struct ReceiveSignEvent {
    pub timestamp: SystemTime,
    pub origin: VerifyingKey,
    pub sign: Sign,
}

/// The replica voted for a block in the commit phase by broadcasting a [`Commit`].
pub struct CommitVoteEvent {
    pub timestamp: SystemTime,
    pub commit: Commit,
}

/// The replica received a commit vote from a peer.
pub struct ReceiveCommitEvent {
    pub timestamp: SystemTime,
    pub origin: VerifyingKey,
    pub commit: Commit,
}

/// The replica broadcast a [`ViewChange`] for its proposed next view.
pub struct ViewChangeVoteEvent {
    pub timestamp: SystemTime,
    pub view_change: ViewChange,
}

/// The replica received a view change from a peer.
pub struct ReceiveViewChangeEvent {
    pub timestamp: SystemTime,
    pub origin: VerifyingKey,
    pub view_change: ViewChange,
}

/// The replica's view timer expired, advancing its proposed next view.
pub struct ViewTimeoutEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub to_view: ViewNumber,
    pub change_cycle: u32,
}

/// The replica collected enough view changes and entered a new view.
pub struct AdvanceViewEvent {
    pub timestamp: SystemTime,
    pub old_view: ViewNumber,
    pub new_view: ViewNumber,
}

/// The committed-prepare checkpoint was persisted to the backup store.
pub struct BackupCheckpointEvent {
    pub timestamp: SystemTime,
    pub height: BlockHeight,
    pub block_hash: CryptoHash,
}

/// A block gathered both quorums and was sealed. Emitted at most once per block hash.
pub struct SealGeneratedEvent {
    pub timestamp: SystemTime,
    pub height: BlockHeight,
    pub block_hash: CryptoHash,
    pub block: SealedBlock,
    /// Whether the local replica was the block's proposer.
    pub is_primary: bool,
}

/// The chain reported a newly committed block and the engine advanced its height cursor.
pub struct ReportBlockEvent {
    pub timestamp: SystemTime,
    pub height: BlockHeight,
    pub next_height: BlockHeight,
}
