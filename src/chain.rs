/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait for the pluggable block execution and storage layer.
//!
//! The engine orders blocks; it does not execute or store them. Both concerns live behind the
//! [`Chain`] trait: when a proposal arrives, the engine asks the chain to validate and execute the
//! proposed block bytes, and votes only over the hash of the block the chain produced. What
//! "execution" means (transaction application, state-root computation, gas accounting) is entirely
//! the host's business.

use std::fmt::{self, Display, Formatter};

use crate::types::{
    basic::CryptoHash,
    block::BlockSummary,
};

/// A block that the chain has validated and re-executed locally.
pub struct ExecutedBlock {
    /// Hash the chain computed for the block exactly as received. The engine rejects the proposal
    /// if this differs from the hash the proposer claimed.
    pub received_hash: CryptoHash,
    /// Summary of the block after local re-sealing. Its hash may legitimately differ from
    /// `received_hash` (e.g., because sealing stamps in locally-derived header fields); this is
    /// the hash the replica's votes are over.
    pub header: BlockSummary,
    /// The re-sealed block, serialized. These bytes replace the proposer's bytes in the replica's
    /// accepted proposal.
    pub block: Vec<u8>,
    /// Number of user transactions in the block. Zero triggers the empty-block view change when
    /// the engine is configured to omit empty blocks.
    pub transaction_count: u64,
}

/// Trait for the pluggable block execution and storage layer.
pub trait Chain: Send + 'static {
    /// Validate and execute the proposed block bytes, returning the executed form. Errors reject
    /// the proposal without advancing any consensus state.
    fn check_block_valid(
        &mut self,
        claimed_hash: &CryptoHash,
        block: &[u8],
    ) -> Result<ExecutedBlock, ChainError>;

    /// Cache an executed block so that a subsequent import of the sealed form does not re-execute
    /// it.
    fn add_block_cache(&mut self, executed: &ExecutedBlock);

    /// The serialized block with the given pre-seal hash, if the chain stores one.
    fn block(&self, hash: &CryptoHash) -> Option<Vec<u8>>;
}

/// Reason the chain rejected a proposed block.
#[derive(Debug)]
pub enum ChainError {
    /// The block bytes could not be decoded.
    Malformed(String),
    /// The block decoded but failed validation or execution.
    Invalid(String),
}

impl Display for ChainError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::Malformed(what) => write!(f, "malformed block: {}", what),
            ChainError::Invalid(what) => write!(f, "invalid block: {}", what),
        }
    }
}
