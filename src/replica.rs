/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that start a replica, as well as the type which keeps the replica alive.
//!
//! A replica is one process participating in (or observing) PBFT consensus. Starting one wires
//! together the operator's pluggable providers — networking, roster, chain, and backup storage —
//! and spawns three threads:
//! 1. The **poller**, which drains the network provider into the inbound queue.
//! 2. The **worker**, which owns the whole consensus state machine and is the only thread that
//!    touches it.
//! 3. The **event bus**, which runs registered event handlers (started only when there are
//!    handlers to run).
//!
//! The returned [`Replica`] keeps the threads alive; dropping it shuts them down in reverse
//! dependency order. The host drives consensus through the [`ConsensusHandle`] obtained from
//! [`Replica::handle`]: polling [`should_seal`](ConsensusHandle::should_seal) from its sealing
//! loop, submitting proposals with [`generate_seal`](ConsensusHandle::generate_seal) and
//! [`generate_commit`](ConsensusHandle::generate_commit), and reporting chain advancement with
//! [`report_block`](ConsensusHandle::report_block). Sealed blocks come back through the
//! [`SealGeneratedEvent`](crate::events::SealGeneratedEvent) handler.

use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

use ed25519_dalek::SigningKey;

use crate::backup::BackupStore;
use crate::chain::Chain;
use crate::config::Configuration;
use crate::event_bus::{start_event_bus, EventHandlers, HandlerPtr};
use crate::events::*;
use crate::networking::{network::PeerNetwork, receiving::start_polling, sending::Broadcaster};
use crate::pbft::protocol::Core;
use crate::roster::Roster;
use crate::types::{
    basic::{ReplicaIndex, SignatureBytes},
    block::BlockSummary,
    keypair::Keypair,
};
use crate::verifier;
use crate::worker::{start_worker, ConsensusHandle};

/// Event handlers the host registers when starting a replica. All fields default to `None`.
#[derive(Default)]
pub struct Handlers {
    pub on_propose: Option<HandlerPtr<ProposeEvent>>,
    pub on_receive_prepare: Option<HandlerPtr<ReceivePrepareEvent>>,
    pub on_sign_vote: Option<HandlerPtr<SignVoteEvent>>,
    pub on_receive_sign: Option<HandlerPtr<ReceiveSignEvent>>,
    pub on_commit_vote: Option<HandlerPtr<CommitVoteEvent>>,
    pub on_receive_commit: Option<HandlerPtr<ReceiveCommitEvent>>,
    pub on_view_change_vote: Option<HandlerPtr<ViewChangeVoteEvent>>,
    pub on_receive_view_change: Option<HandlerPtr<ReceiveViewChangeEvent>>,
    pub on_view_timeout: Option<HandlerPtr<ViewTimeoutEvent>>,
    pub on_advance_view: Option<HandlerPtr<AdvanceViewEvent>>,
    pub on_backup_checkpoint: Option<HandlerPtr<BackupCheckpointEvent>>,
    pub on_seal_generated: Option<HandlerPtr<SealGeneratedEvent>>,
    pub on_report_block: Option<HandlerPtr<ReportBlockEvent>>,
}

pub struct Replica<R: Roster> {
    roster: R,
    handle: ConsensusHandle,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    worker: Option<JoinHandle<()>>,
    worker_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl<R: Roster> Replica<R> {
    /// Start a replica. `current_tip` is the chain's present head; the engine seeds its height
    /// cursor from it, exactly as if the chain had just reported it.
    pub fn start(
        config: Configuration,
        signing_key: SigningKey,
        network: impl PeerNetwork,
        roster: R,
        chain: impl Chain,
        backup: impl BackupStore,
        current_tip: BlockSummary,
        handlers: Handlers,
    ) -> Replica<R> {
        let keypair = Keypair::new(signing_key);

        let event_handlers = EventHandlers::new(config.log_events, handlers);
        let (event_bus, event_bus_shutdown, event_publisher) = if event_handlers.is_empty() {
            (None, None, None)
        } else {
            let (event_publisher, event_subscriber) = mpsc::channel();
            let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
            let event_bus = start_event_bus(
                event_handlers,
                event_subscriber,
                event_bus_shutdown_receiver,
            );
            (Some(event_bus), Some(event_bus_shutdown), Some(event_publisher))
        };

        let broadcaster = Broadcaster::new(
            network.clone(),
            roster.clone(),
            config.seen_filter_capacities,
        );

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let (poller, inbound) = start_polling(network, poller_shutdown_receiver);

        let core = Core::new(
            config,
            keypair,
            roster.clone(),
            chain,
            backup,
            broadcaster,
            event_publisher,
        );

        let (worker_shutdown, worker_shutdown_receiver) = mpsc::channel();
        let (worker, handle) =
            start_worker(core, roster.clone(), inbound, worker_shutdown_receiver);

        handle.report_block(current_tip);

        Replica {
            roster,
            handle,
            poller: Some(poller),
            poller_shutdown,
            worker: Some(worker),
            worker_shutdown,
            event_bus,
            event_bus_shutdown,
        }
    }

    /// The handle through which the host drives this replica.
    pub fn handle(&self) -> ConsensusHandle {
        self.handle.clone()
    }

    /// Validate a sealed block's signature list on import. See
    /// [`verifier::check_block_sign`](crate::verifier::check_block_sign).
    pub fn check_block_sign(
        &self,
        header: &BlockSummary,
        signatures: &[(ReplicaIndex, SignatureBytes)],
    ) -> bool {
        verifier::check_block_sign(&self.roster, header, signatures)
    }
}

impl<R: Roster> Drop for Replica<R> {
    fn drop(&mut self) {
        // Safety: the order of thread shutdown in this function is important, as the threads make
        // assumptions about the validity of their channels based on this. The worker receives
        // messages from the poller, and assumes that the poller will live longer than it.

        if let Some(event_bus_shutdown) = &self.event_bus_shutdown {
            let _ = event_bus_shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            event_bus.join().unwrap();
        }

        let _ = self.worker_shutdown.send(());
        self.worker.take().unwrap().join().unwrap();

        let _ = self.poller_shutdown.send(());
        self.poller.take().unwrap().join().unwrap();
    }
}
