/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Block summary types exchanged between the engine and its host.
//!
//! The engine never interprets block contents: proposals carry the serialized block as an opaque
//! byte vector, and the host describes a block to the engine through a [`BlockSummary`]. Once a
//! block gathers a commit quorum, the engine wraps the executed block bytes together with the full
//! commit-vote evidence set into a [`SealedBlock`] and hands it to the host for import.

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::VerifyingKey;

use super::basic::{BlockHeight, CryptoHash, ReplicaIndex, SignatureBytes};

/// The fields of a block header that the engine needs to sequence it: its height, its hash
/// excluding the seal, and the miner set the block declares.
#[derive(Clone)]
pub struct BlockSummary {
    pub height: BlockHeight,
    /// Hash of the header with the seal fields excluded. This is the value every consensus
    /// signature is over.
    pub hash: CryptoHash,
    /// The miner public keys the block declares, in roster index order.
    pub node_list: Vec<VerifyingKey>,
}

/// A block that gathered a commit quorum, paired with its consensus certificate.
///
/// `signatures` holds every commit vote collected for the block, not merely a quorum of them:
/// downstream verifiers iterate the full set. Each entry is the signer's roster index and its
/// signature over the block's pre-seal hash.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct SealedBlock {
    pub block: Vec<u8>,
    pub signatures: Vec<(ReplicaIndex, SignatureBytes)>,
}
