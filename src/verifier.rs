/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Validation of a sealed block's consensus certificate on import.
//!
//! A sealed block carries the set of commit signatures that sealed it. An importer calls
//! [`check_block_sign`] before accepting the block: the signer set in the block *is* the
//! consensus certificate, and a block whose certificate does not verify against the roster as of
//! the previous height is not a chain extension, whatever its contents.

use ed25519_dalek::{Signature, Verifier};

use crate::roster::{self, Roster};
use crate::types::{
    basic::{BlockHeight, ReplicaIndex, SignatureBytes},
    block::BlockSummary,
};

/// Check a sealed block's signature list against the roster snapshot at the block's parent
/// height.
///
/// Rejects if the block's declared miner set differs from the snapshot, if fewer than
/// `N − ⌊(N−1)/3⌋` signatures are present, or if any single signature fails to verify over the
/// block's pre-seal hash. All verdicts are logged; the boolean is the import decision.
pub fn check_block_sign<R: Roster>(
    roster: &R,
    header: &BlockSummary,
    signatures: &[(ReplicaIndex, SignatureBytes)],
) -> bool {
    let snapshot_height = BlockHeight::new(header.height.int().saturating_sub(1));
    let miner_list = match roster.miner_list(snapshot_height) {
        Some(miner_list) => miner_list,
        None => {
            log::warn!(
                "check_block_sign failed: no roster snapshot at height {}",
                snapshot_height
            );
            return false;
        }
    };

    if header.node_list != miner_list {
        log::warn!(
            "check_block_sign failed at height {}: declared miner set differs from the roster \
             snapshot ({} declared, {} in roster)",
            header.height,
            header.node_list.len(),
            miner_list.len()
        );
        return false;
    }

    let quorum = roster::quorum(miner_list.len() as u64);
    if (signatures.len() as u64) < quorum {
        log::warn!(
            "check_block_sign failed at height {}: {} signatures, quorum is {}",
            header.height,
            signatures.len(),
            quorum
        );
        return false;
    }

    for (idx, sig) in signatures {
        let signer = match miner_list.get(idx.int() as usize) {
            Some(signer) => signer,
            None => {
                log::warn!(
                    "check_block_sign failed at height {}: signer index {} out of bounds",
                    header.height,
                    idx
                );
                return false;
            }
        };
        let signature = Signature::from_bytes(&sig.bytes());
        if signer.verify(&header.hash.bytes(), &signature).is_err() {
            log::warn!(
                "check_block_sign failed at height {}: signature from index {} does not verify",
                header.height,
                idx
            );
            return false;
        }
    }

    true
}
