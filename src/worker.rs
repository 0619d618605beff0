/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The worker thread: a serialised event pump around the [`Core`] state machine, and the
//! [`ConsensusHandle`] through which the host drives it.
//!
//! Every iteration the worker drains any pending host commands, pops at most one inbound message
//! (waiting up to 5 ms for one), and then always runs the periodic duties: the timeout check, the
//! future-proposal drain, and garbage collection. Handler errors are logged and swallowed; the
//! loop only exits on the shutdown signal.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ed25519_dalek::VerifyingKey;

use crate::backup::BackupStore;
use crate::chain::Chain;
use crate::networking::network::PeerNetwork;
use crate::pbft::messages::ConsensusMessage;
use crate::pbft::protocol::{Core, ProtocolError};
use crate::roster::Roster;
use crate::types::{basic::ViewNumber, block::BlockSummary};

const POP_TIMEOUT: Duration = Duration::from_millis(5);

/// Commands the host sends into the worker. Queries carry a reply channel.
pub(crate) enum Command {
    ShouldSeal {
        reply: Sender<bool>,
    },
    GenerateSeal {
        header: BlockSummary,
        block: Vec<u8>,
        reply: Sender<Result<ViewNumber, ProtocolError>>,
    },
    GenerateCommit {
        header: BlockSummary,
        block: Vec<u8>,
        view: ViewNumber,
        reply: Sender<Result<(), ProtocolError>>,
    },
    ReportBlock {
        header: BlockSummary,
    },
    EmptyBlockSealed,
}

/// Cloneable handle through which the host invokes the engine. All methods forward to the worker
/// thread; the query methods block until it answers, which takes at most one worker iteration.
#[derive(Clone)]
pub struct ConsensusHandle {
    commands: Sender<Command>,
}

impl ConsensusHandle {
    /// The sealing gate: whether this node should build and propose a block now. Hosts poll this
    /// from their sealing loop.
    pub fn should_seal(&self) -> bool {
        let (reply, response) = mpsc::channel();
        if self.commands.send(Command::ShouldSeal { reply }).is_err() {
            return false;
        }
        response.recv().unwrap_or(false)
    }

    /// Propose `block` for the current slot. Returns the view the proposal was made under; pass
    /// it back to [`generate_commit`](Self::generate_commit) once the block is executed.
    pub fn generate_seal(
        &self,
        header: &BlockSummary,
        block: &[u8],
    ) -> Result<ViewNumber, ProtocolError> {
        let (reply, response) = mpsc::channel();
        self.commands
            .send(Command::GenerateSeal {
                header: header.clone(),
                block: block.to_vec(),
                reply,
            })
            .map_err(|_| ProtocolError::Config)?;
        response.recv().map_err(|_| ProtocolError::Config)?
    }

    /// Enter the sign phase for our own executed proposal. Fails if the view moved on while the
    /// block was executing.
    pub fn generate_commit(
        &self,
        header: &BlockSummary,
        block: &[u8],
        view: ViewNumber,
    ) -> Result<(), ProtocolError> {
        let (reply, response) = mpsc::channel();
        self.commands
            .send(Command::GenerateCommit {
                header: header.clone(),
                block: block.to_vec(),
                view,
                reply,
            })
            .map_err(|_| ProtocolError::Config)?;
        response.recv().map_err(|_| ProtocolError::Config)?
    }

    /// Tell the engine the chain committed a block. Advances the height cursor and re-checks the
    /// roster. Idempotent per tip.
    pub fn report_block(&self, header: BlockSummary) {
        let _ = self.commands.send(Command::ReportBlock { header });
    }

    /// Tell the engine that the host's own freshly sealed proposal contained no user
    /// transactions, so the slot should be handed over instead of voted through. Only meaningful
    /// when empty blocks are omitted.
    pub fn empty_block_sealed(&self) {
        let _ = self.commands.send(Command::EmptyBlockSealed);
    }
}

/// Spawn the worker thread around `core`. Returns the join handle and the host-facing command
/// handle.
pub(crate) fn start_worker<N, R, C, B>(
    mut core: Core<N, R, C, B>,
    roster: R,
    inbound: Receiver<(VerifyingKey, ConsensusMessage)>,
    shutdown_signal: Receiver<()>,
) -> (JoinHandle<()>, ConsensusHandle)
where
    N: PeerNetwork,
    R: Roster,
    C: Chain,
    B: BackupStore,
{
    let (command_sender, commands) = mpsc::channel();

    let worker_thread = thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("worker thread disconnected from main thread")
            }
        }

        loop {
            match commands.try_recv() {
                Ok(command) => on_command(&mut core, command),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        match inbound.recv_timeout(POP_TIMEOUT) {
            Ok((origin, msg)) => on_message(&mut core, &roster, origin, msg),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }

        core.check_timeout();
        core.handle_future_block();
        core.collect_garbage();
    });

    (
        worker_thread,
        ConsensusHandle {
            commands: command_sender,
        },
    )
}

fn on_command<N, R, C, B>(core: &mut Core<N, R, C, B>, command: Command)
where
    N: PeerNetwork,
    R: Roster,
    C: Chain,
    B: BackupStore,
{
    match command {
        Command::ShouldSeal { reply } => {
            let _ = reply.send(core.should_seal());
        }
        Command::GenerateSeal {
            header,
            block,
            reply,
        } => {
            let _ = reply.send(core.generate_seal(&header, &block));
        }
        Command::GenerateCommit {
            header,
            block,
            view,
            reply,
        } => {
            let _ = reply.send(core.generate_commit(&header, &block, view));
        }
        Command::ReportBlock { header } => core.report_block(header),
        Command::EmptyBlockSealed => core.change_view_for_empty_block_by_host(),
    }
}

fn on_message<N, R, C, B>(
    core: &mut Core<N, R, C, B>,
    roster: &R,
    origin: VerifyingKey,
    msg: ConsensusMessage,
) where
    N: PeerNetwork,
    R: Roster,
    C: Chain,
    B: BackupStore,
{
    let from = match roster.index_of(&origin) {
        Some(idx) => idx,
        None => {
            log::warn!("received a consensus message from an unknown peer, dropping");
            return;
        }
    };

    let result = match msg.clone() {
        ConsensusMessage::Prepare(req) => core.handle_prepare(from, origin, req, false),
        ConsensusMessage::Sign(req) => core.handle_sign(origin, req),
        ConsensusMessage::Commit(req) => core.handle_commit(origin, req),
        ConsensusMessage::ViewChange(req) => core.handle_view_change(from, origin, req),
    };

    if let Err(err) = result {
        if err.is_benign() {
            log::debug!(
                "dropped {:?} message at height {} from idx {}: {}",
                msg.kind(),
                msg.height(),
                msg.idx(),
                err
            );
        } else {
            log::warn!(
                "rejected {:?} message at height {} from idx {}: {}",
                msg.kind(),
                msg.height(),
                msg.idx(),
                err
            );
        }
    }

    // Relaying is independent of whether we accepted the message: a vote we already hold is still
    // news to peers that do not.
    core.maybe_rebroadcast(&origin, from, &msg);
}
