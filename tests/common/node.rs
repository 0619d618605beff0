//! Wires one replica together with a sealing loop and an import path, the way a real host embeds
//! the engine.
//!
//! Things the nodes of a cluster have in common: the roster, the genesis block, and the
//! configuration. Things they differ in: the keypair, the network stub, and their chain and
//! backup instances.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use ed25519_dalek::{SigningKey, VerifyingKey};
use pbft_rs::{
    config::Configuration,
    events::SealGeneratedEvent,
    types::{basic::BlockHeight, block::BlockSummary},
    verifier, ConsensusHandle, Handlers, Replica,
};

use crate::common::chain::{make_block, FixedRoster, MemBackup, MockChain};
use crate::common::network::NetworkStub;

pub(crate) struct Node {
    pub(crate) chain: MockChain,
    handle: ConsensusHandle,
    sealing_stop: Arc<AtomicBool>,
    sealing_loop: Option<JoinHandle<()>>,
    // Dropped after the sealing loop is joined.
    _replica: Replica<FixedRoster>,
}

impl Node {
    pub(crate) fn new(
        keypair: SigningKey,
        network: NetworkStub,
        miners: Vec<VerifyingKey>,
        config: Configuration,
    ) -> Node {
        let roster = FixedRoster {
            miners: miners.clone(),
        };
        let chain = MockChain::new(miners.clone());
        let backup = MemBackup::default();

        // The import handler needs the consensus handle to report the new tip, but the handle
        // only exists once the replica is started. Hand it over through a shared slot.
        let handle_slot: Arc<Mutex<Option<ConsensusHandle>>> = Arc::new(Mutex::new(None));

        // Import path: every sealed block is certificate-checked, imported, and reported back to
        // the engine. The handler runs on the event-bus thread.
        let import_chain = chain.clone();
        let import_roster = roster.clone();
        let import_handle_slot = handle_slot.clone();
        let on_seal_generated = Box::new(move |event: &SealGeneratedEvent| {
            let header = BlockSummary {
                height: event.height,
                hash: event.block_hash,
                node_list: import_roster.miners.clone(),
            };
            if !verifier::check_block_sign(&import_roster, &header, &event.block.signatures) {
                panic!("sealed block failed certificate verification");
            }
            if let Some(new_tip) = import_chain.import(&event.block.block) {
                if let Some(handle) = import_handle_slot.lock().unwrap().as_ref() {
                    handle.report_block(new_tip);
                }
            }
        });

        let replica = Replica::start(
            config,
            keypair,
            network,
            roster,
            chain.clone(),
            backup,
            chain.tip(),
            Handlers {
                on_seal_generated: Some(on_seal_generated),
                ..Handlers::default()
            },
        );
        let handle = replica.handle();
        *handle_slot.lock().unwrap() = Some(handle.clone());

        // Sealing loop: poll the gate, and when elected build the next block and walk it through
        // generate_seal / generate_commit.
        let sealing_stop = Arc::new(AtomicBool::new(false));
        let sealing_loop = {
            let stop = sealing_stop.clone();
            let handle = handle.clone();
            let chain = chain.clone();
            thread::spawn(move || {
                let mut last_proposed_height = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(20));
                    if !handle.should_seal() {
                        continue;
                    }

                    let next_height = chain.tip_height() + 1;
                    if next_height == last_proposed_height {
                        continue;
                    }

                    let (block, hash) = make_block(next_height, 1, vec![next_height as u8]);
                    let header = BlockSummary {
                        height: BlockHeight::new(next_height),
                        hash,
                        node_list: miners.clone(),
                    };

                    let view = match handle.generate_seal(&header, &block) {
                        Ok(view) => view,
                        Err(_) => continue,
                    };
                    last_proposed_height = next_height;
                    // Execution is the identity for test blocks, so the same bytes go straight
                    // into the sign phase.
                    let _ = handle.generate_commit(&header, &block, view);
                }
            })
        };

        Node {
            chain,
            handle,
            sealing_stop,
            sealing_loop: Some(sealing_loop),
            _replica: replica,
        }
    }

    pub(crate) fn tip_height(&self) -> u64 {
        self.chain.tip_height()
    }

    #[allow(dead_code)]
    pub(crate) fn handle(&self) -> ConsensusHandle {
        self.handle.clone()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.sealing_stop.store(true, Ordering::Relaxed);
        if let Some(sealing_loop) = self.sealing_loop.take() {
            let _ = sealing_loop.join();
        }
    }
}
