/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that receives events emitted by the worker thread and passes them to event handlers.
//!
//! When the thread receives a message containing an [event](crate::events::Event), it triggers the
//! execution of all handlers defined for the contained event type, where the handlers for each
//! event type are stored in [`EventHandlers`].
//!
//! ## Event Handlers
//!
//! A replica's instance of `EventHandlers` contains:
//! 1. The handlers provided upon building the replica, and
//! 2. If logging is enabled via the replica's [config](crate::config::Configuration), the default
//!    logging handlers defined in [logging](crate::logging).

use std::{
    sync::mpsc::{Receiver, TryRecvError},
    thread,
    thread::JoinHandle,
};

use crate::{events::*, logging::Logger};

/// Pointer to a handler closure, parametrised by the argument (for our use case, event) type.
pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Stores the two optional handlers enabled for an event type that implements the [`Logger`]
/// trait, namely one logging handler, defined in [`logging`](crate::logging), and one
/// user-defined handler.
pub(crate) struct HandlerPair<T: Logger> {
    pub(crate) user_defined_handler: Option<HandlerPtr<T>>,
    pub(crate) logging_handler: Option<HandlerPtr<T>>,
}

impl<T: Logger> HandlerPair<T> {
    // Checks if no event handlers are defined for this event.
    fn is_empty(&self) -> bool {
        self.user_defined_handler.is_none() && self.logging_handler.is_none()
    }

    /// Creates a new `HandlerPair` with the user-defined handler, and the default logging handler
    /// if logging is enabled.
    fn new(log: bool, user_defined_handler: Option<HandlerPtr<T>>) -> HandlerPair<T> {
        HandlerPair {
            user_defined_handler,
            logging_handler: if log { Some(T::get_logger()) } else { None },
        }
    }

    fn fire(&self, event: &T) {
        if let Some(handler) = &self.user_defined_handler {
            handler(event)
        }
        if let Some(handler) = &self.logging_handler {
            handler(event)
        }
    }
}

/// Stores the `HandlerPair` of user-defined and optional logging handlers for each pre-defined
/// event type from [events](crate::events).
pub(crate) struct EventHandlers {
    pub(crate) propose_handlers: HandlerPair<ProposeEvent>,
    pub(crate) receive_prepare_handlers: HandlerPair<ReceivePrepareEvent>,
    pub(crate) sign_vote_handlers: HandlerPair<SignVoteEvent>,
    pub(crate) receive_sign_handlers: HandlerPair<ReceiveSignEvent>,
    pub(crate) commit_vote_handlers: HandlerPair<CommitVoteEvent>,
    pub(crate) receive_commit_handlers: HandlerPair<ReceiveCommitEvent>,

    pub(crate) view_change_vote_handlers: HandlerPair<ViewChangeVoteEvent>,
    pub(crate) receive_view_change_handlers: HandlerPair<ReceiveViewChangeEvent>,
    pub(crate) view_timeout_handlers: HandlerPair<ViewTimeoutEvent>,
    pub(crate) advance_view_handlers: HandlerPair<AdvanceViewEvent>,

    pub(crate) backup_checkpoint_handlers: HandlerPair<BackupCheckpointEvent>,
    pub(crate) seal_generated_handlers: HandlerPair<SealGeneratedEvent>,
    pub(crate) report_block_handlers: HandlerPair<ReportBlockEvent>,
}

impl EventHandlers {
    /// Creates the [handler pairs](HandlerPair) for all pre-defined event types given the
    /// user-registered [`Handlers`](crate::replica::Handlers), and information on whether logging
    /// is enabled.
    pub(crate) fn new(log: bool, handlers: crate::replica::Handlers) -> EventHandlers {
        EventHandlers {
            propose_handlers: HandlerPair::new(log, handlers.on_propose),
            receive_prepare_handlers: HandlerPair::new(log, handlers.on_receive_prepare),
            sign_vote_handlers: HandlerPair::new(log, handlers.on_sign_vote),
            receive_sign_handlers: HandlerPair::new(log, handlers.on_receive_sign),
            commit_vote_handlers: HandlerPair::new(log, handlers.on_commit_vote),
            receive_commit_handlers: HandlerPair::new(log, handlers.on_receive_commit),
            view_change_vote_handlers: HandlerPair::new(log, handlers.on_view_change_vote),
            receive_view_change_handlers: HandlerPair::new(log, handlers.on_receive_view_change),
            view_timeout_handlers: HandlerPair::new(log, handlers.on_view_timeout),
            advance_view_handlers: HandlerPair::new(log, handlers.on_advance_view),
            backup_checkpoint_handlers: HandlerPair::new(log, handlers.on_backup_checkpoint),
            seal_generated_handlers: HandlerPair::new(log, handlers.on_seal_generated),
            report_block_handlers: HandlerPair::new(log, handlers.on_report_block),
        }
    }

    /// Checks if no handlers are defined, i.e., neither user-defined handlers were defined nor
    /// logging is enabled.
    pub(crate) fn is_empty(&self) -> bool {
        self.propose_handlers.is_empty()
            && self.receive_prepare_handlers.is_empty()
            && self.sign_vote_handlers.is_empty()
            && self.receive_sign_handlers.is_empty()
            && self.commit_vote_handlers.is_empty()
            && self.receive_commit_handlers.is_empty()
            && self.view_change_vote_handlers.is_empty()
            && self.receive_view_change_handlers.is_empty()
            && self.view_timeout_handlers.is_empty()
            && self.advance_view_handlers.is_empty()
            && self.backup_checkpoint_handlers.is_empty()
            && self.seal_generated_handlers.is_empty()
            && self.report_block_handlers.is_empty()
    }

    /// Triggers the execution of each of the two handlers - the user-defined and the logging
    /// handler, if defined - for a given event type from [events](crate::events).
    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::Propose(event) => self.propose_handlers.fire(&event),
            Event::ReceivePrepare(event) => self.receive_prepare_handlers.fire(&event),
            Event::SignVote(event) => self.sign_vote_handlers.fire(&event),
            Event::ReceiveSign(event) => self.receive_sign_handlers.fire(&event),
            Event::CommitVote(event) => self.commit_vote_handlers.fire(&event),
            Event::ReceiveCommit(event) => self.receive_commit_handlers.fire(&event),
            Event::ViewChangeVote(event) => self.view_change_vote_handlers.fire(&event),
            Event::ReceiveViewChange(event) => self.receive_view_change_handlers.fire(&event),
            Event::ViewTimeout(event) => self.view_timeout_handlers.fire(&event),
            Event::AdvanceView(event) => self.advance_view_handlers.fire(&event),
            Event::BackupCheckpoint(event) => self.backup_checkpoint_handlers.fire(&event),
            Event::SealGenerated(event) => self.seal_generated_handlers.fire(&event),
            Event::ReportBlock(event) => self.report_block_handlers.fire(&event),
        }
    }
}

/// Starts the event bus thread, which runs an infinite loop until a shutdown signal is received
/// from the parent thread. In each iteration of the loop, the thread checks if it received any
/// event notifications, and if so, then triggers the execution of the handlers defined for the
/// event.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from main thread")
            }
        }

        match event_subscriber.try_recv() {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(TryRecvError::Empty) => thread::yield_now(),
            Err(TryRecvError::Disconnected) => return,
        }
    })
}
