//! A minimal in-memory blockchain shared between a node's replica and its sealing loop.
//!
//! Blocks are Borsh tuples of `(height, transaction count, payload)`, identified by the SHA-256
//! of their bytes. "Execution" just decodes and re-hashes; there is no state machine behind the
//! blocks, which is all the consensus tests need.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::VerifyingKey;
use pbft_rs::{
    backup::{BackupError, BackupStore},
    chain::{Chain, ChainError, ExecutedBlock},
    roster::{AccountType, Roster},
    types::{
        basic::{BlockHeight, CryptoHash, ReplicaIndex},
        block::BlockSummary,
    },
};
use sha2::{Digest, Sha256};

/// A fixed, fully connected miner roster.
#[derive(Clone)]
pub(crate) struct FixedRoster {
    pub(crate) miners: Vec<VerifyingKey>,
}

impl Roster for FixedRoster {
    fn account_type(&self, key: &VerifyingKey) -> Option<AccountType> {
        self.miners.contains(key).then_some(AccountType::Miner)
    }

    fn index_of(&self, key: &VerifyingKey) -> Option<ReplicaIndex> {
        self.miners
            .iter()
            .position(|miner| miner == key)
            .map(|pos| ReplicaIndex::new(pos as u64))
    }

    fn public_key(&self, idx: ReplicaIndex) -> Option<VerifyingKey> {
        self.miners.get(idx.int() as usize).copied()
    }

    fn miner_count(&self) -> u64 {
        self.miners.len() as u64
    }

    fn miner_list(&self, _height: BlockHeight) -> Option<Vec<VerifyingKey>> {
        Some(self.miners.clone())
    }
}

/// The genesis tip shared by every node in a test cluster.
pub(crate) fn genesis(miners: &[VerifyingKey]) -> BlockSummary {
    BlockSummary {
        height: BlockHeight::new(0),
        hash: CryptoHash::new([0; 32]),
        node_list: miners.to_vec(),
    }
}

/// Serialize a test block and compute its hash.
pub(crate) fn make_block(height: u64, transactions: u64, payload: Vec<u8>) -> (Vec<u8>, CryptoHash) {
    let bytes = (BlockHeight::new(height), transactions, payload)
        .try_to_vec()
        .unwrap();
    let hash = CryptoHash::new(Sha256::digest(&bytes).into());
    (bytes, hash)
}

struct ChainState {
    tip: BlockSummary,
    blocks: HashMap<CryptoHash, Vec<u8>>,
}

/// Shared in-memory chain. Cloning shares the underlying state: a node's replica, sealing loop,
/// and the test body all see the same tip.
#[derive(Clone)]
pub(crate) struct MockChain {
    miners: Vec<VerifyingKey>,
    state: Arc<Mutex<ChainState>>,
}

impl MockChain {
    pub(crate) fn new(miners: Vec<VerifyingKey>) -> MockChain {
        MockChain {
            state: Arc::new(Mutex::new(ChainState {
                tip: genesis(&miners),
                blocks: HashMap::new(),
            })),
            miners,
        }
    }

    pub(crate) fn tip(&self) -> BlockSummary {
        self.state.lock().unwrap().tip.clone()
    }

    pub(crate) fn tip_height(&self) -> u64 {
        self.state.lock().unwrap().tip.height.int()
    }

    /// Import a sealed block's bytes if it extends the tip. Returns the new tip if it did.
    pub(crate) fn import(&self, block: &[u8]) -> Option<BlockSummary> {
        let (height, _transactions, _payload) =
            <(BlockHeight, u64, Vec<u8>)>::try_from_slice(block).ok()?;
        let hash = CryptoHash::new(Sha256::digest(block).into());

        let mut state = self.state.lock().unwrap();
        if height != state.tip.height + 1 {
            return None;
        }
        state.blocks.insert(hash, block.to_vec());
        state.tip = BlockSummary {
            height,
            hash,
            node_list: self.miners.clone(),
        };
        Some(state.tip.clone())
    }
}

impl Chain for MockChain {
    fn check_block_valid(
        &mut self,
        _claimed_hash: &CryptoHash,
        block: &[u8],
    ) -> Result<ExecutedBlock, ChainError> {
        let (height, transactions, _payload) =
            <(BlockHeight, u64, Vec<u8>)>::try_from_slice(block)
                .map_err(|err| ChainError::Malformed(err.to_string()))?;
        let hash = CryptoHash::new(Sha256::digest(block).into());
        Ok(ExecutedBlock {
            received_hash: hash,
            header: BlockSummary {
                height,
                hash,
                node_list: self.miners.clone(),
            },
            block: block.to_vec(),
            transaction_count: transactions,
        })
    }

    fn add_block_cache(&mut self, _executed: &ExecutedBlock) {}

    fn block(&self, hash: &CryptoHash) -> Option<Vec<u8>> {
        self.state.lock().unwrap().blocks.get(hash).cloned()
    }
}

/// A volatile in-memory [`BackupStore`].
#[derive(Clone, Default)]
pub(crate) struct MemBackup(Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>);

impl BackupStore for MemBackup {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(key).cloned()
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), BackupError> {
        self.0.lock().unwrap().insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}
