/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the replica's
//! [config](crate::config::Configuration).
//!
//! The engine logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values
//! are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. Hashes and public keys are
//! printed as the first seven characters of their Base64 encoding.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use std::time::SystemTime;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const PROPOSE: &str = "Propose";
pub const RECEIVE_PREPARE: &str = "ReceivePrepare";
pub const SIGN_VOTE: &str = "SignVote";
pub const RECEIVE_SIGN: &str = "ReceiveSign";
pub const COMMIT_VOTE: &str = "CommitVote";
pub const RECEIVE_COMMIT: &str = "ReceiveCommit";

pub const VIEW_CHANGE_VOTE: &str = "ViewChangeVote";
pub const RECEIVE_VIEW_CHANGE: &str = "ReceiveViewChange";
pub const VIEW_TIMEOUT: &str = "ViewTimeout";
pub const ADVANCE_VIEW: &str = "AdvanceView";

pub const BACKUP_CHECKPOINT: &str = "BackupCheckpoint";
pub const SEAL_GENERATED: &str = "SealGenerated";
pub const REPORT_BLOCK: &str = "ReportBlock";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for ProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ProposeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PROPOSE,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.prepare.block_hash.bytes()),
                event.prepare.height,
                event.prepare.view
            )
        })
    }
}

impl Logger for ReceivePrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceivePrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_PREPARE,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.origin.to_bytes()),
                first_seven_base64_chars(&event.prepare.block_hash.bytes()),
                event.prepare.height,
                event.prepare.view
            )
        })
    }
}

impl Logger for SignVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &SignVoteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                SIGN_VOTE,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.sign.block_hash.bytes()),
                event.sign.height,
                event.sign.view
            )
        })
    }
}

impl Logger for ReceiveSignEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveSignEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_SIGN,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.origin.to_bytes()),
                first_seven_base64_chars(&event.sign.block_hash.bytes()),
                event.sign.idx
            )
        })
    }
}

impl Logger for CommitVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CommitVoteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COMMIT_VOTE,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.commit.block_hash.bytes()),
                event.commit.height,
                event.commit.view
            )
        })
    }
}

impl Logger for ReceiveCommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveCommitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_COMMIT,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.origin.to_bytes()),
                first_seven_base64_chars(&event.commit.block_hash.bytes()),
                event.commit.idx
            )
        })
    }
}

impl Logger for ViewChangeVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ViewChangeVoteEvent| {
            log::info!(
                "{}, {}, {}, {}",
                VIEW_CHANGE_VOTE,
                secs_since_unix_epoch(event.timestamp),
                event.view_change.height,
                event.view_change.view
            )
        })
    }
}

impl Logger for ReceiveViewChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveViewChangeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_VIEW_CHANGE,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.origin.to_bytes()),
                event.view_change.height,
                event.view_change.view
            )
        })
    }
}

impl Logger for ViewTimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ViewTimeoutEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                VIEW_TIMEOUT,
                secs_since_unix_epoch(event.timestamp),
                event.view,
                event.to_view,
                event.change_cycle
            )
        })
    }
}

impl Logger for AdvanceViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &AdvanceViewEvent| {
            log::info!(
                "{}, {}, {}, {}",
                ADVANCE_VIEW,
                secs_since_unix_epoch(event.timestamp),
                event.old_view,
                event.new_view
            )
        })
    }
}

impl Logger for BackupCheckpointEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &BackupCheckpointEvent| {
            log::info!(
                "{}, {}, {}, {}",
                BACKUP_CHECKPOINT,
                secs_since_unix_epoch(event.timestamp),
                event.height,
                first_seven_base64_chars(&event.block_hash.bytes())
            )
        })
    }
}

impl Logger for SealGeneratedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &SealGeneratedEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                SEAL_GENERATED,
                secs_since_unix_epoch(event.timestamp),
                event.height,
                first_seven_base64_chars(&event.block_hash.bytes()),
                event.block.signatures.len(),
                event.is_primary
            )
        })
    }
}

impl Logger for ReportBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReportBlockEvent| {
            log::info!(
                "{}, {}, {}, {}",
                REPORT_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                event.height,
                event.next_height
            )
        })
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first
// 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Event occured before the Unix Epoch.")
        .as_secs()
}
