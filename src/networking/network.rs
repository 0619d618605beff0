//! Trait for pluggable peer-to-peer (P2P) networking.
//!
//! Main trait: [`PeerNetwork`].

use ed25519_dalek::VerifyingKey;

use crate::pbft::messages::ConsensusMessage;

/// Trait for pluggable peer-to-peer (P2P) networking.
///
/// The engine identifies peers by their Ed25519 public keys and never holds peer objects: peer
/// connections are owned entirely by the network provider, and the engine addresses them through
/// this trait. `send` must not block; implementations are expected to enqueue into per-peer write
/// queues.
pub trait PeerNetwork: Clone + Send + 'static {
    /// The public keys of all currently connected peers.
    fn connected_peers(&self) -> Vec<VerifyingKey>;

    /// Whether a peer with the given public key is currently connected.
    fn is_connected(&self, peer: &VerifyingKey) -> bool;

    /// Send a message to the specified peer without blocking.
    fn send(&mut self, peer: &VerifyingKey, message: ConsensusMessage);

    /// Receive a message from any peer. Returns immediately with a `None` if no message is
    /// available now.
    fn recv(&mut self) -> Option<(VerifyingKey, ConsensusMessage)>;
}
