//! The poller thread, which drains the network provider into the worker's inbound queue.

use std::{
    sync::mpsc::{self, Receiver, TryRecvError},
    thread::{self, JoinHandle},
};

use ed25519_dalek::VerifyingKey;

use crate::pbft::messages::ConsensusMessage;

use super::network::PeerNetwork;

/// Spawn the poller thread, which polls the [`PeerNetwork`] for messages and pushes them into the
/// inbound queue consumed by the worker loop. The queue is the only boundary between the network
/// provider's threads and the worker thread.
pub(crate) fn start_polling<N: PeerNetwork>(
    mut network: N,
    shutdown_signal: Receiver<()>,
) -> (JoinHandle<()>, Receiver<(VerifyingKey, ConsensusMessage)>) {
    let (to_worker, inbound) = mpsc::channel();

    let poller_thread = thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("poller thread disconnected from main thread")
            }
        }

        if let Some((origin, msg)) = network.recv() {
            let _ = to_worker.send((origin, msg));
        } else {
            thread::yield_now()
        }
    });

    (poller_thread, inbound)
}
