//! Fan-out of consensus messages to miner peers, with per-peer dedup filters.
//!
//! ## Peer-seen filters
//!
//! For every connected peer and every message kind, the broadcaster keeps a bounded
//! insertion-ordered set of message [fingerprints](crate::pbft::messages::Fingerprint) the peer
//! is known to have: either because the peer sent us the message, or because we previously sent
//! it to them. Broadcast skips peers whose filter already holds the fingerprint, which keeps the
//! same message from bouncing between peers indefinitely. When a filter reaches its capacity, the
//! oldest fingerprint is evicted.
//!
//! The filters exist only to suppress re-broadcast. They are not a security boundary: the vote
//! caches perform their own content-based dedup.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use ed25519_dalek::VerifyingKey;
use indexmap::IndexSet;

use crate::config::SeenFilterCapacities;
use crate::pbft::messages::{ConsensusMessage, Fingerprint, MessageKind};
use crate::roster::{AccountType, Roster};

use super::network::PeerNetwork;

/// Insertion-ordered fingerprint sets for one peer, one per message kind.
struct PeerSeen {
    prepare: IndexSet<Fingerprint>,
    sign: IndexSet<Fingerprint>,
    commit: IndexSet<Fingerprint>,
    view_change: IndexSet<Fingerprint>,
}

impl PeerSeen {
    fn new() -> PeerSeen {
        PeerSeen {
            prepare: IndexSet::new(),
            sign: IndexSet::new(),
            commit: IndexSet::new(),
            view_change: IndexSet::new(),
        }
    }

    fn set(&mut self, kind: MessageKind) -> &mut IndexSet<Fingerprint> {
        match kind {
            MessageKind::Prepare => &mut self.prepare,
            MessageKind::Sign => &mut self.sign,
            MessageKind::Commit => &mut self.commit,
            MessageKind::ViewChange => &mut self.view_change,
        }
    }

    fn contains(&mut self, kind: MessageKind, fingerprint: &Fingerprint) -> bool {
        self.set(kind).contains(fingerprint)
    }

    fn mark(&mut self, kind: MessageKind, fingerprint: Fingerprint, cap: usize) {
        let set = self.set(kind);
        if set.contains(&fingerprint) {
            return;
        }
        while set.len() >= cap {
            set.shift_remove_index(0);
        }
        set.insert(fingerprint);
    }

    #[cfg(test)]
    fn len(&self, kind: MessageKind) -> usize {
        match kind {
            MessageKind::Prepare => self.prepare.len(),
            MessageKind::Sign => self.sign.len(),
            MessageKind::Commit => self.commit.len(),
            MessageKind::ViewChange => self.view_change.len(),
        }
    }
}

/// Fans consensus messages out to connected miner peers, tracking what each peer has seen.
///
/// Filters live behind one small mutex per peer so the worker thread and host-facing calls can
/// share the broadcaster through clones.
#[derive(Clone)]
pub(crate) struct Broadcaster<N: PeerNetwork, R: Roster> {
    network: N,
    roster: R,
    caps: SeenFilterCapacities,
    seen: Arc<Mutex<HashMap<VerifyingKey, Arc<Mutex<PeerSeen>>>>>,
}

impl<N: PeerNetwork, R: Roster> Broadcaster<N, R> {
    pub(crate) fn new(network: N, roster: R, caps: SeenFilterCapacities) -> Broadcaster<N, R> {
        Broadcaster {
            network,
            roster,
            caps,
            seen: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Send `message` to every connected miner peer that is neither in `exclude` nor recorded as
    /// having already seen it. Peers in `exclude` are marked as having seen the message without
    /// being sent it: the caller knows they have it already.
    pub(crate) fn broadcast(
        &mut self,
        message: &ConsensusMessage,
        exclude: &HashSet<VerifyingKey>,
    ) {
        let kind = message.kind();
        let fingerprint = message.fingerprint();
        let cap = self.caps.for_kind(kind);

        for peer in self.network.connected_peers() {
            if self.roster.account_type(&peer) != Some(AccountType::Miner) {
                continue;
            }

            let seen = self.seen_for(&peer);
            let mut seen = seen.lock().unwrap();
            if exclude.contains(&peer) {
                seen.mark(kind, fingerprint, cap);
                continue;
            }
            if seen.contains(kind, &fingerprint) {
                continue;
            }

            self.network.send(&peer, message.clone());
            seen.mark(kind, fingerprint, cap);
        }
    }

    /// Send `message` to a single peer, marking it as seen by that peer.
    pub(crate) fn unicast(&mut self, peer: &VerifyingKey, message: ConsensusMessage) {
        let kind = message.kind();
        let fingerprint = message.fingerprint();
        let cap = self.caps.for_kind(kind);

        self.network.send(peer, message);
        let seen = self.seen_for(peer);
        seen.lock().unwrap().mark(kind, fingerprint, cap);
    }

    /// Wipe every peer's filters. Only invoked when the node intentionally replays content it
    /// previously suppressed, such as the committed-prepare during recovery: clearing the masks
    /// in any other situation floods the network with old messages.
    pub(crate) fn clear_mask(&mut self) {
        self.seen.lock().unwrap().clear();
    }

    pub(crate) fn is_connected(&self, peer: &VerifyingKey) -> bool {
        self.network.is_connected(peer)
    }

    #[cfg(test)]
    pub(crate) fn seen_len(&self, peer: &VerifyingKey, kind: MessageKind) -> usize {
        self.seen
            .lock()
            .unwrap()
            .get(peer)
            .map_or(0, |seen| seen.lock().unwrap().len(kind))
    }

    fn seen_for(&mut self, peer: &VerifyingKey) -> Arc<Mutex<PeerSeen>> {
        self.seen
            .lock()
            .unwrap()
            .entry(*peer)
            .or_insert_with(|| Arc::new(Mutex::new(PeerSeen::new())))
            .clone()
    }
}
