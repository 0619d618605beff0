/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait for the pluggable roster/identity service, and quorum arithmetic.
//!
//! The roster is the ordered set of miner identities. It is the source of the primary formula
//! (`(view + height) mod N`) and of the public keys used to verify consensus signatures. The
//! engine never owns roster state: it queries a [`Roster`] handle passed in through the replica
//! constructor, and re-reads it on every chain advancement so that membership changes made by the
//! host take effect at the next height.

use ed25519_dalek::VerifyingKey;

use crate::types::basic::{BlockHeight, ReplicaIndex};

/// What role a public key plays in the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccountType {
    /// Votes in consensus.
    Miner,
    /// Follows the chain without voting.
    Observer,
}

/// Trait for the pluggable roster/identity service.
///
/// Implementations are expected to be cheap to clone (e.g., an `Arc` around shared state), since
/// the engine, the broadcaster, and the block-signature verifier each hold their own handle.
pub trait Roster: Clone + Send + 'static {
    /// The account type of a public key. Returns `None` if the key is unknown.
    fn account_type(&self, key: &VerifyingKey) -> Option<AccountType>;

    /// The roster index of a miner public key. Returns `None` if the key is not a miner.
    fn index_of(&self, key: &VerifyingKey) -> Option<ReplicaIndex>;

    /// The public key of the miner at `idx`, if the index is in range.
    fn public_key(&self, idx: ReplicaIndex) -> Option<VerifyingKey>;

    /// The number of miners in the current roster.
    fn miner_count(&self) -> u64;

    /// The miner public keys in index order, as of the roster snapshot taken at `height`. Returns
    /// `None` if no snapshot exists for that height.
    fn miner_list(&self, height: BlockHeight) -> Option<Vec<VerifyingKey>>;
}

/// The number of Byzantine failures tolerated by a roster of `n` miners: `⌊(n − 1) / 3⌋`.
pub const fn max_faulty(n: u64) -> u64 {
    n.saturating_sub(1) / 3
}

/// The number of matching votes that constitutes agreement under a roster of `n` miners:
/// `n − ⌊(n − 1) / 3⌋`, equivalently `2f + 1`.
pub const fn quorum(n: u64) -> u64 {
    n - max_faulty(n)
}
