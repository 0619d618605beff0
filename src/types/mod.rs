/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types shared across the subprotocols of the library.

/// The hash function blocks are identified with. Hosts hash a block's pre-seal bytes with this to
/// produce the [`CryptoHash`](basic::CryptoHash) that consensus signatures are over.
pub use sha2::Sha256 as CryptoHasher;

pub mod basic;

pub mod block;

pub mod keypair;
