/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Structured messages that are sent between replicas as part of the PBFT subprotocol.
//!
//! ## Messages
//!
//! The protocol involves four types of messages:
//! 1. [`Prepare`]: broadcasted by the primary of a given view, who proposes to extend the
//!    blockchain by inserting the block contained in the message.
//! 2. [`Sign`]: broadcasted by a miner that executed the proposed block and agrees with its
//!    contents.
//! 3. [`Commit`]: broadcasted by a miner that collected a quorum of sign votes for the block.
//! 4. [`ViewChange`]: broadcasted by a miner that suspects the current primary has failed.
//!
//! ## Signing scope
//!
//! Every message carries two signatures: `sig` is over the block hash alone, and is the signature
//! that ends up in the sealed block's certificate; `sig2` authenticates the full message metadata.
//! The scope of `sig2` deliberately excludes the block payload, so that retransmitting a proposal
//! does not change its signatures, and includes the message kind tag, so a vote for one phase
//! cannot be replayed as a vote for another.
//!
//! ## Wire format
//!
//! Messages are Borsh-encoded [`ConsensusMessage`] values. Field order is fixed by the struct
//! definitions, which makes `sig2` reproducible across peers, and the enum discriminant doubles
//! as the wire kind byte (`Prepare = 0, Sign = 1, Commit = 2, ViewChange = 3`).

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::types::{
    basic::{BlockHeight, CryptoHash, ReplicaIndex, SignatureBytes, Timestamp, ViewNumber},
    keypair::Keypair,
};

/// Identifies the four wire message kinds. The discriminants match the Borsh enum tag of
/// [`ConsensusMessage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub enum MessageKind {
    Prepare,
    Sign,
    Commit,
    ViewChange,
}

/// Deterministic content-derived key of a message, used for dedup and peer-seen tracking.
///
/// Two messages have equal fingerprints exactly when they agree on kind, height, view, sender
/// index, and block hash, so the fingerprint is collision-free across distinct messages by
/// construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub kind: MessageKind,
    pub height: BlockHeight,
    pub view: ViewNumber,
    pub idx: ReplicaIndex,
    pub block_hash: CryptoHash,
}

/// Common accessors and verification for the four message records.
///
/// All four records share the same metadata fields; this trait lets the vote caches, the dedup
/// filters, and the signature checks operate on any of them uniformly.
pub trait SignedMessage {
    const KIND: MessageKind;

    fn height(&self) -> BlockHeight;
    fn view(&self) -> ViewNumber;
    fn idx(&self) -> ReplicaIndex;
    fn timestamp(&self) -> Timestamp;
    fn block_hash(&self) -> CryptoHash;
    fn sig(&self) -> SignatureBytes;
    fn sig2(&self) -> SignatureBytes;

    /// The Borsh encoding of every field except the block payload and `sig2` itself, prefixed
    /// with the kind tag. This is the signing scope of `sig2`.
    fn metadata_bytes(&self) -> Vec<u8> {
        (
            Self::KIND,
            self.height(),
            self.view(),
            self.idx(),
            self.timestamp(),
            self.block_hash(),
            self.sig(),
        )
            .try_to_vec()
            .expect("serializing message metadata into a vec is infallible")
    }

    fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            kind: Self::KIND,
            height: self.height(),
            view: self.view(),
            idx: self.idx(),
            block_hash: self.block_hash(),
        }
    }

    /// Whether both signatures verify against the given public key: `sig` over the block hash,
    /// `sig2` over the metadata.
    fn is_correct(&self, pk: &VerifyingKey) -> bool {
        let sig = Signature::from_bytes(&self.sig().bytes());
        let sig2 = Signature::from_bytes(&self.sig2().bytes());
        pk.verify(&self.block_hash().bytes(), &sig).is_ok()
            && pk.verify(&self.metadata_bytes(), &sig2).is_ok()
    }
}

macro_rules! impl_signed_message {
    ($t:ident, $kind:expr) => {
        impl SignedMessage for $t {
            const KIND: MessageKind = $kind;

            fn height(&self) -> BlockHeight {
                self.height
            }
            fn view(&self) -> ViewNumber {
                self.view
            }
            fn idx(&self) -> ReplicaIndex {
                self.idx
            }
            fn timestamp(&self) -> Timestamp {
                self.timestamp
            }
            fn block_hash(&self) -> CryptoHash {
                self.block_hash
            }
            fn sig(&self) -> SignatureBytes {
                self.sig
            }
            fn sig2(&self) -> SignatureBytes {
                self.sig2
            }
        }
    };
}

/// Broadcasted by the primary of a given view to propose a block. Carries the serialized block;
/// everything else is metadata over its hash.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Prepare {
    pub height: BlockHeight,
    pub view: ViewNumber,
    pub idx: ReplicaIndex,
    pub timestamp: Timestamp,
    pub block_hash: CryptoHash,
    pub sig: SignatureBytes,
    pub sig2: SignatureBytes,
    pub block: Vec<u8>,
}

impl_signed_message!(Prepare, MessageKind::Prepare);

impl Prepare {
    /// Create a `Prepare` signed with `keypair`, claiming `idx` as the author.
    ///
    /// `idx` is a parameter rather than always the signer's own index because a replica that
    /// re-executes a proposal rebuilds the `Prepare` under the original primary's index, keeping
    /// the primary the author of record.
    pub fn new(
        keypair: &Keypair,
        height: BlockHeight,
        view: ViewNumber,
        idx: ReplicaIndex,
        block_hash: CryptoHash,
        block: Vec<u8>,
    ) -> Prepare {
        let timestamp = Timestamp::now();
        let sig = keypair.sign(&block_hash.bytes());
        let metadata = (
            MessageKind::Prepare,
            height,
            view,
            idx,
            timestamp,
            block_hash,
            sig,
        )
            .try_to_vec()
            .expect("serializing message metadata into a vec is infallible");
        let sig2 = keypair.sign(&metadata);
        Prepare {
            height,
            view,
            idx,
            timestamp,
            block_hash,
            sig,
            sig2,
            block,
        }
    }
}

/// A miner's sign-phase vote over the hash of the block it executed.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Sign {
    pub height: BlockHeight,
    pub view: ViewNumber,
    pub idx: ReplicaIndex,
    pub timestamp: Timestamp,
    pub block_hash: CryptoHash,
    pub sig: SignatureBytes,
    pub sig2: SignatureBytes,
}

impl_signed_message!(Sign, MessageKind::Sign);

impl Sign {
    pub fn new(
        keypair: &Keypair,
        height: BlockHeight,
        view: ViewNumber,
        idx: ReplicaIndex,
        block_hash: CryptoHash,
    ) -> Sign {
        let timestamp = Timestamp::now();
        let sig = keypair.sign(&block_hash.bytes());
        let metadata = (MessageKind::Sign, height, view, idx, timestamp, block_hash, sig)
            .try_to_vec()
            .expect("serializing message metadata into a vec is infallible");
        let sig2 = keypair.sign(&metadata);
        Sign {
            height,
            view,
            idx,
            timestamp,
            block_hash,
            sig,
            sig2,
        }
    }
}

/// A miner's commit-phase vote, broadcast once it has collected a quorum of sign votes.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Commit {
    pub height: BlockHeight,
    pub view: ViewNumber,
    pub idx: ReplicaIndex,
    pub timestamp: Timestamp,
    pub block_hash: CryptoHash,
    pub sig: SignatureBytes,
    pub sig2: SignatureBytes,
}

impl_signed_message!(Commit, MessageKind::Commit);

impl Commit {
    pub fn new(
        keypair: &Keypair,
        height: BlockHeight,
        view: ViewNumber,
        idx: ReplicaIndex,
        block_hash: CryptoHash,
    ) -> Commit {
        let timestamp = Timestamp::now();
        let sig = keypair.sign(&block_hash.bytes());
        let metadata = (
            MessageKind::Commit,
            height,
            view,
            idx,
            timestamp,
            block_hash,
            sig,
        )
            .try_to_vec()
            .expect("serializing message metadata into a vec is infallible");
        let sig2 = keypair.sign(&metadata);
        Commit {
            height,
            view,
            idx,
            timestamp,
            block_hash,
            sig,
            sig2,
        }
    }
}

/// Broadcast by a miner whose view timer expired, or that otherwise suspects the primary.
/// `height` and `block_hash` identify the sender's chain tip, and `view` is the view it proposes
/// to move to.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct ViewChange {
    pub height: BlockHeight,
    pub view: ViewNumber,
    pub idx: ReplicaIndex,
    pub timestamp: Timestamp,
    pub block_hash: CryptoHash,
    pub sig: SignatureBytes,
    pub sig2: SignatureBytes,
}

impl_signed_message!(ViewChange, MessageKind::ViewChange);

impl ViewChange {
    pub fn new(
        keypair: &Keypair,
        height: BlockHeight,
        view: ViewNumber,
        idx: ReplicaIndex,
        block_hash: CryptoHash,
    ) -> ViewChange {
        let timestamp = Timestamp::now();
        let sig = keypair.sign(&block_hash.bytes());
        let metadata = (
            MessageKind::ViewChange,
            height,
            view,
            idx,
            timestamp,
            block_hash,
            sig,
        )
            .try_to_vec()
            .expect("serializing message metadata into a vec is infallible");
        let sig2 = keypair.sign(&metadata);
        ViewChange {
            height,
            view,
            idx,
            timestamp,
            block_hash,
            sig,
            sig2,
        }
    }
}

/// The four wire messages as one Borsh-encodable enum. The variant order fixes the kind bytes.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub enum ConsensusMessage {
    Prepare(Prepare),
    Sign(Sign),
    Commit(Commit),
    ViewChange(ViewChange),
}

impl ConsensusMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ConsensusMessage::Prepare(_) => MessageKind::Prepare,
            ConsensusMessage::Sign(_) => MessageKind::Sign,
            ConsensusMessage::Commit(_) => MessageKind::Commit,
            ConsensusMessage::ViewChange(_) => MessageKind::ViewChange,
        }
    }

    pub fn height(&self) -> BlockHeight {
        match self {
            ConsensusMessage::Prepare(m) => m.height,
            ConsensusMessage::Sign(m) => m.height,
            ConsensusMessage::Commit(m) => m.height,
            ConsensusMessage::ViewChange(m) => m.height,
        }
    }

    pub fn idx(&self) -> ReplicaIndex {
        match self {
            ConsensusMessage::Prepare(m) => m.idx,
            ConsensusMessage::Sign(m) => m.idx,
            ConsensusMessage::Commit(m) => m.idx,
            ConsensusMessage::ViewChange(m) => m.idx,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        match self {
            ConsensusMessage::Prepare(m) => m.fingerprint(),
            ConsensusMessage::Sign(m) => m.fingerprint(),
            ConsensusMessage::Commit(m) => m.fingerprint(),
            ConsensusMessage::ViewChange(m) => m.fingerprint(),
        }
    }
}

impl From<Prepare> for ConsensusMessage {
    fn from(prepare: Prepare) -> Self {
        ConsensusMessage::Prepare(prepare)
    }
}

impl From<Sign> for ConsensusMessage {
    fn from(sign: Sign) -> Self {
        ConsensusMessage::Sign(sign)
    }
}

impl From<Commit> for ConsensusMessage {
    fn from(commit: Commit) -> Self {
        ConsensusMessage::Commit(commit)
    }
}

impl From<ViewChange> for ConsensusMessage {
    fn from(view_change: ViewChange) -> Self {
        ConsensusMessage::ViewChange(view_change)
    }
}
