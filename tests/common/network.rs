//! A "mock" (totally local) network for passing consensus messages between nodes in one process.

use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use ed25519_dalek::VerifyingKey;
use pbft_rs::{networking::network::PeerNetwork, pbft::messages::ConsensusMessage};

/// A network stub that passes messages to and from nodes using channels.
///
/// The set of peers reachable from a given `NetworkStub` is fixed on construction by
/// [`mock_network`]; a node that is never started simply never drains its inbox, which is how the
/// tests model a crashed node.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    my_verifying_key: VerifyingKey,
    all_peers: HashMap<VerifyingKey, Sender<(VerifyingKey, ConsensusMessage)>>,
    inbox: Arc<Mutex<Receiver<(VerifyingKey, ConsensusMessage)>>>,
}

impl PeerNetwork for NetworkStub {
    fn connected_peers(&self) -> Vec<VerifyingKey> {
        self.all_peers
            .keys()
            .filter(|peer| **peer != self.my_verifying_key)
            .copied()
            .collect()
    }

    fn is_connected(&self, peer: &VerifyingKey) -> bool {
        self.all_peers.contains_key(peer)
    }

    fn send(&mut self, peer: &VerifyingKey, message: ConsensusMessage) {
        if let Some(peer) = self.all_peers.get(peer) {
            let _ = peer.send((self.my_verifying_key, message));
        }
    }

    fn recv(&mut self) -> Option<(VerifyingKey, ConsensusMessage)> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(o_m) => Some(o_m),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => panic!(),
        }
    }
}

/// Create a vector of `NetworkStub`s, connecting the provided set of `peers`.
///
/// `NetworkStub`s feature in the returned vector in the same order as the provided `peers`, i.e.,
/// the i-th network stub is the network stub for the i-th peer.
pub(crate) fn mock_network(peers: impl Iterator<Item = VerifyingKey>) -> Vec<NetworkStub> {
    let mut all_peers = HashMap::new();
    let peer_and_inboxes: Vec<(VerifyingKey, Receiver<(VerifyingKey, ConsensusMessage)>)> = peers
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(peer, sender);

            (peer, receiver)
        })
        .collect();

    peer_and_inboxes
        .into_iter()
        .map(|(my_verifying_key, inbox)| NetworkStub {
            my_verifying_key,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
        })
        .collect()
}
