/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust implementation of Practical Byzantine Fault Tolerance (PBFT) for permissioned
//! blockchains.
//!
//! The engine sequences host-built blocks through the three-phase PBFT vote
//! (pre-prepare → prepare → commit, here `Prepare`/`Sign`/`Commit`), rotates the primary through
//! view changes when it is suspected, and emits each agreed block together with a quorum
//! certificate of commit signatures. A roster of `N` miner nodes tolerates up to
//! `⌊(N−1)/3⌋` Byzantine members.
//!
//! Networking, block execution, block storage, roster management, and durable checkpoint storage
//! are all pluggable: the host implements [`PeerNetwork`](networking::network::PeerNetwork),
//! [`Chain`](chain::Chain), [`Roster`](roster::Roster), and [`BackupStore`](backup::BackupStore)
//! (or uses the provided [`RocksBackup`](backup::RocksBackup)), and starts a
//! [`Replica`](replica::Replica) around them.

pub mod backup;

pub mod chain;

pub mod config;

pub mod event_bus;

pub mod events;

pub mod networking;

pub mod pbft;

pub mod replica;

pub mod roster;

pub mod types;

pub mod verifier;

pub(crate) mod logging;

pub(crate) mod worker;

// Re-exports
pub use replica::{Handlers, Replica};
pub use worker::ConsensusHandle;
