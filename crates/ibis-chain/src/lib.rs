//! Consensus-critical components for the ibis node.
//!
//! This crate knows nothing about peers or networking. It validates blocks
//! against the Bitcoin consensus rules, keeps the UTXO set and the block
//! index in their databases, persists raw blocks one file per height, and
//! tracks which heights are available on disk. The wire crate drives all of
//! it from the sync state machine.

pub mod block_store;
pub mod block_tracker;
pub mod chainparams;
pub mod chainstore;
pub mod chunk_validator;
pub mod consensus;
pub mod error;
pub mod header_chain;
pub mod utxo_batch;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use block_store::BlockStore;
pub use block_tracker::BlockTracker;
pub use chainparams::ChainParams;
pub use chainstore::kv_chainstore::KvBlockIndex;
pub use chainstore::kv_chainstore::KvUtxoStore;
pub use chainstore::BlockIndexEntry;
pub use chainstore::BlockIndexStore;
pub use chainstore::BlockStatus;
pub use chainstore::FlushStats;
pub use chainstore::UtxoEntry;
pub use chainstore::UtxoStore;
pub use chainstore::UtxoView;
pub use chunk_validator::BlockSource;
pub use chunk_validator::ChunkError;
pub use chunk_validator::ChunkProgress;
pub use chunk_validator::ChunkValidator;
pub use consensus::Consensus;
pub use consensus::NullScriptVerifier;
pub use consensus::ScriptVerifier;
pub use error::BlockValidationErrors;
pub use error::BlockchainError;
pub use header_chain::HeaderChain;
pub use utxo_batch::UtxoBatch;
