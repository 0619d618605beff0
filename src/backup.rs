/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Durable storage for the committed-prepare checkpoint.
//!
//! The engine persists exactly one value: the proposal that most recently reached a sign-phase
//! quorum, under the key [`COMMITTED_KEY`]. The write happens on the commit critical path,
//! immediately before the commit vote is broadcast, so that a replica which crashes between
//! reaching the sign quorum and persisting the block can re-propose the same content after
//! restart instead of forfeiting the agreed block.
//!
//! Storage is behind the small [`BackupStore`] trait so that tests can substitute an in-memory
//! map; [`RocksBackup`] is the production implementation.

use std::fmt::{self, Display, Formatter};
use std::path::Path;

/// Key under which the committed-prepare checkpoint is stored.
pub const COMMITTED_KEY: &[u8] = b"committed";

/// Trait for the durable key/value store backing the committed-prepare checkpoint.
pub trait BackupStore: Send + 'static {
    /// The value stored under `key`, if any.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Durably store `value` under `key`. A failure here must not abort the caller's commit path:
    /// the engine logs it and continues, accepting that a crash before chain persistence will
    /// restart consensus for the height.
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), BackupError>;
}

/// Error writing to or opening a [`BackupStore`].
#[derive(Debug)]
pub enum BackupError {
    /// The store could not be opened because another process holds its lock.
    AlreadyOpen,
    /// The store could not be opened for lack of disk space.
    NotEnoughSpace,
    /// Any other storage-level failure.
    Io(String),
}

impl Display for BackupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BackupError::AlreadyOpen => write!(
                f,
                "backup database already open; another instance appears to be running"
            ),
            BackupError::NotEnoughSpace => {
                write!(f, "not enough disk space to open the backup database")
            }
            BackupError::Io(what) => write!(f, "backup store failure: {}", what),
        }
    }
}

/// RocksDB-backed [`BackupStore`].
#[derive(Clone)]
pub struct RocksBackup(std::sync::Arc<rocksdb::DB>);

impl RocksBackup {
    /// Open (creating if missing) the backup database at `path`. If `repair` is set, attempt a
    /// RocksDB repair pass before opening; operators request this after an unclean shutdown left
    /// the database corrupt.
    ///
    /// Open failures are fatal to the replica: consensus without the crash-recovery checkpoint
    /// would silently weaken the protocol's guarantees.
    pub fn open(path: impl AsRef<Path>, repair: bool) -> Result<RocksBackup, BackupError> {
        let mut options = rocksdb::Options::default();
        options.create_if_missing(true);
        options.set_max_open_files(256);

        if repair {
            if let Err(err) = rocksdb::DB::repair(&options, path.as_ref()) {
                log::warn!("repair of backup database failed: {}", err);
            }
        }

        match rocksdb::DB::open(&options, path.as_ref()) {
            Ok(db) => Ok(RocksBackup(std::sync::Arc::new(db))),
            Err(err) => Err(classify_open_error(err)),
        }
    }
}

impl BackupStore for RocksBackup {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.0.get(key) {
            Ok(value) => value,
            Err(err) => {
                log::warn!("backup read failed: {}", err);
                None
            }
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), BackupError> {
        self.0
            .put(key, value)
            .map_err(|err| BackupError::Io(err.to_string()))
    }
}

fn classify_open_error(err: rocksdb::Error) -> BackupError {
    let what = err.to_string();
    // RocksDB reports a held lock through the LOCK file in the database directory.
    if what.contains("lock") || what.contains("LOCK") {
        BackupError::AlreadyOpen
    } else if what.contains("No space") || what.contains("space") {
        BackupError::NotEnoughSpace
    } else {
        BackupError::Io(what)
    }
}
