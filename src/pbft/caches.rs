/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Vote caches for the sign, commit, and view-change phases.
//!
//! The caches are plain maps keyed by block hash (for phase votes) or by view (for view changes),
//! with one slot per signer underneath: a signer has at most one live vote per block hash, and
//! re-submission overwrites. Buckets are created lazily on first insert and removed by the purge
//! methods, which the core invokes on chain advancement, on view changes, and from periodic
//! garbage collection.

use std::collections::{BTreeMap, HashMap};

use crate::types::basic::{BlockHeight, CryptoHash, ReplicaIndex, ViewNumber};

use super::messages::{SignedMessage, ViewChange};

/// Per-hash cache of phase votes, one vote per signer. Used for both the sign and the commit
/// phases.
pub(crate) struct VoteCache<V: SignedMessage> {
    votes: HashMap<CryptoHash, HashMap<ReplicaIndex, V>>,
}

impl<V: SignedMessage + Clone> VoteCache<V> {
    pub(crate) fn new() -> VoteCache<V> {
        VoteCache {
            votes: HashMap::new(),
        }
    }

    /// Whether a vote from the same signer for the same block hash is already cached.
    pub(crate) fn contains(&self, vote: &V) -> bool {
        self.votes
            .get(&vote.block_hash())
            .is_some_and(|bucket| bucket.contains_key(&vote.idx()))
    }

    /// Insert `vote`, overwriting any previous vote by the same signer for the same hash.
    pub(crate) fn insert(&mut self, vote: V) {
        self.votes
            .entry(vote.block_hash())
            .or_default()
            .insert(vote.idx(), vote);
    }

    /// The number of distinct signers with a cached vote for `hash`.
    pub(crate) fn count(&self, hash: &CryptoHash) -> u64 {
        self.votes.get(hash).map_or(0, |bucket| bucket.len() as u64)
    }

    /// All cached votes for `hash`.
    pub(crate) fn votes(&self, hash: &CryptoHash) -> impl Iterator<Item = &V> {
        self.votes.get(hash).into_iter().flat_map(|bucket| bucket.values())
    }

    /// Drop votes for `hash` whose view differs from `view`. A new proposal for a hash
    /// invalidates votes cast under earlier views of the same hash.
    pub(crate) fn retain_view(&mut self, hash: &CryptoHash, view: ViewNumber) {
        if let Some(bucket) = self.votes.get_mut(hash) {
            bucket.retain(|_, vote| vote.view() == view);
        }
    }

    /// Remove the bucket for `hash` entirely.
    pub(crate) fn remove(&mut self, hash: &CryptoHash) {
        self.votes.remove(hash);
    }

    /// Drop votes below `height` and then any bucket left empty. Returns the hashes of the
    /// buckets that were removed, so the caller can clean up per-hash bookkeeping tied to them.
    pub(crate) fn prune_below(&mut self, height: BlockHeight) -> Vec<CryptoHash> {
        let mut removed = Vec::new();
        self.votes.retain(|hash, bucket| {
            bucket.retain(|_, vote| vote.height() >= height);
            if bucket.is_empty() {
                removed.push(*hash);
                false
            } else {
                true
            }
        });
        removed
    }

    pub(crate) fn clear(&mut self) {
        self.votes.clear();
    }
}

/// Per-view cache of pending view changes, one per signer.
///
/// Backed by a `BTreeMap` so the fast view-change scan can walk views in order.
pub(crate) struct ViewChangeCache {
    votes: BTreeMap<ViewNumber, HashMap<ReplicaIndex, ViewChange>>,
}

/// Result of scanning the cache for evidence that more than `f` miners are already past our
/// proposed view.
pub(crate) struct AheadOfUs {
    /// Number of distinct signers with a view change beyond `to_view`.
    pub(crate) signers: u64,
    /// The lowest view beyond `to_view` any of them proposed.
    pub(crate) min_view: ViewNumber,
    /// The lowest chain tip any of them reported.
    pub(crate) min_height: BlockHeight,
}

impl ViewChangeCache {
    pub(crate) fn new() -> ViewChangeCache {
        ViewChangeCache {
            votes: BTreeMap::new(),
        }
    }

    pub(crate) fn contains(&self, view: ViewNumber, idx: ReplicaIndex) -> bool {
        self.votes
            .get(&view)
            .is_some_and(|bucket| bucket.contains_key(&idx))
    }

    pub(crate) fn insert(&mut self, view_change: ViewChange) {
        self.votes
            .entry(view_change.view)
            .or_default()
            .insert(view_change.idx, view_change);
    }

    /// The number of distinct signers with a pending view change at exactly `view`.
    pub(crate) fn count_at(&self, view: ViewNumber) -> u64 {
        self.votes.get(&view).map_or(0, |bucket| bucket.len() as u64)
    }

    /// Drop, within the bucket for `view`, entries that contradict the local chain tip: heights
    /// below it, or matching heights with a different tip hash.
    pub(crate) fn purge_conflicting_at(
        &mut self,
        view: ViewNumber,
        tip_height: BlockHeight,
        tip_hash: &CryptoHash,
    ) {
        if let Some(bucket) = self.votes.get_mut(&view) {
            bucket.retain(|_, vc| {
                vc.height > tip_height || (vc.height == tip_height && vc.block_hash == *tip_hash)
            });
        }
    }

    /// Drop entries that contradict the local chain tip across all views, and then any view left
    /// empty. Invoked on chain advancement.
    pub(crate) fn purge_conflicting(&mut self, tip_height: BlockHeight, tip_hash: &CryptoHash) {
        self.votes.retain(|_, bucket| {
            bucket.retain(|_, vc| {
                vc.height > tip_height || (vc.height == tip_height && vc.block_hash == *tip_hash)
            });
            !bucket.is_empty()
        });
    }

    /// Drop all buckets for views at or below `view`. Invoked when the replica enters `view`.
    pub(crate) fn purge_through(&mut self, view: ViewNumber) {
        self.votes.retain(|v, _| *v > view);
    }

    /// Scan for signers with a pending view change beyond `to_view` whose reported tip is at
    /// least `tip_height`, retaining per signer their highest such view. Returns `None` when no
    /// signer qualifies.
    pub(crate) fn ahead_of(
        &self,
        to_view: ViewNumber,
        tip_height: BlockHeight,
    ) -> Option<AheadOfUs> {
        let mut highest_per_signer: HashMap<ReplicaIndex, ViewNumber> = HashMap::new();
        let mut min_view: Option<ViewNumber> = None;
        let mut min_height: Option<BlockHeight> = None;

        for (view, bucket) in self.votes.range((
            std::ops::Bound::Excluded(to_view),
            std::ops::Bound::Unbounded,
        )) {
            for (idx, vc) in bucket {
                if vc.height < tip_height {
                    continue;
                }
                let known = highest_per_signer.get(idx).copied();
                if known.is_none() || known.is_some_and(|v| *view > v) {
                    highest_per_signer.insert(*idx, *view);
                    if min_view.is_none() || min_view.is_some_and(|v| *view < v) {
                        min_view = Some(*view);
                    }
                    if min_height.is_none() || min_height.is_some_and(|h| vc.height < h) {
                        min_height = Some(vc.height);
                    }
                }
            }
        }

        match (min_view, min_height) {
            (Some(min_view), Some(min_height)) => Some(AheadOfUs {
                signers: highest_per_signer.len() as u64,
                min_view,
                min_height,
            }),
            _ => None,
        }
    }
}
