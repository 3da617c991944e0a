//! Validates a consecutive range of stored blocks, strictly in height order,
//! and accumulates their UTXO effects into one [UtxoBatch] that the caller
//! commits atomically.
//!
//! Blocks arrive out of order, but by the time a chunk is handed here the
//! whole range is on disk. Any failure aborts the chunk: the batch is
//! dropped, nothing reaches the database, and the sync machine decides what
//! to re-download.

use std::fmt;

use bitcoin::consensus::deserialize;
use bitcoin::Block;
use bitcoin::BlockHash;
use log::debug;

use crate::block_store::BlockStore;
use crate::chainstore::UtxoView;
use crate::consensus::Consensus;
use crate::consensus::ScriptVerifier;
use crate::error::BlockValidationErrors;
use crate::error::BlockchainError;
use crate::utxo_batch::UtxoBatch;

/// Where the validator reads raw blocks from. The block store implements
/// this; tests substitute an in-memory map.
pub trait BlockSource {
    fn load_block(&self, height: u32) -> Result<Vec<u8>, BlockchainError>;
}

impl BlockSource for BlockStore {
    fn load_block(&self, height: u32) -> Result<Vec<u8>, BlockchainError> {
        self.read_height(height)
    }
}

/// A validation failure pinned to the height it happened at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkError {
    pub height: u32,
    pub error: BlockValidationErrors,
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {}: {}", self.height, self.error)
    }
}

/// What one [ChunkValidator::validate_next] call achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkProgress {
    Validated(u32),
    Done,
}

pub struct ChunkValidator<'a> {
    consensus: &'a Consensus,
    blocks: &'a dyn BlockSource,
    utxos: &'a dyn UtxoView,
    scripts: &'a dyn ScriptVerifier,
    /// Script validation is skipped at or below this height.
    assume_valid_height: u32,

    batch: UtxoBatch,
    next_height: u32,
    end_height: u32,
    prev_hash: BlockHash,
    last_error: Option<ChunkError>,
}

impl<'a> ChunkValidator<'a> {
    /// `prev_hash` is the hash of the block at `start - 1`, which the first
    /// block of the chunk must build on.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consensus: &'a Consensus,
        blocks: &'a dyn BlockSource,
        utxos: &'a dyn UtxoView,
        scripts: &'a dyn ScriptVerifier,
        start: u32,
        end: u32,
        prev_hash: BlockHash,
        assume_valid_height: u32,
    ) -> Self {
        ChunkValidator {
            consensus,
            blocks,
            utxos,
            scripts,
            assume_valid_height,
            batch: UtxoBatch::new(start, end),
            next_height: start,
            end_height: end,
            prev_hash,
            last_error: None,
        }
    }

    /// Validates the next block of the chunk. Consensus failures are recorded
    /// in [ChunkValidator::last_error] before being returned; I/O and
    /// database failures are returned as-is.
    pub fn validate_next(&mut self) -> Result<ChunkProgress, BlockchainError> {
        if self.next_height > self.end_height {
            return Ok(ChunkProgress::Done);
        }
        let height = self.next_height;

        let raw = self.blocks.load_block(height)?;
        let block: Block = match deserialize(&raw) {
            Ok(block) => block,
            Err(_) => {
                // Torn write or garbage from a peer. Either way the file has
                // to go and the height gets re-fetched.
                return Err(BlockchainError::CorruptBlockFile {
                    height,
                    length: raw.len() as u64,
                });
            }
        };

        let scripts = (height > self.assume_valid_height).then_some(self.scripts);
        let result = self.consensus.validate_block(
            &block,
            height,
            self.prev_hash,
            &mut self.batch,
            self.utxos,
            scripts,
        );

        match result {
            Ok(()) => {
                self.prev_hash = block.block_hash();
                self.next_height += 1;
                debug!("validated block {height} ({})", self.prev_hash);
                Ok(ChunkProgress::Validated(height))
            }
            Err(BlockchainError::BlockValidation(error)) => {
                self.last_error = Some(ChunkError { height, error: error.clone() });
                Err(BlockchainError::BlockValidation(error))
            }
            Err(other) => Err(other),
        }
    }

    /// Runs the whole chunk to completion.
    pub fn run(&mut self) -> Result<(), BlockchainError> {
        while self.validate_next()? != ChunkProgress::Done {}
        Ok(())
    }

    /// The hash of the last block validated so far.
    pub fn tip_hash(&self) -> BlockHash {
        self.prev_hash
    }

    pub fn next_height(&self) -> u32 {
        self.next_height
    }

    pub fn last_error(&self) -> Option<&ChunkError> {
        self.last_error.as_ref()
    }

    /// Hands out the accumulated batch for flushing. Only meaningful once
    /// [ChunkValidator::run] succeeded.
    pub fn into_batch(self) -> UtxoBatch {
        self.batch
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::consensus::serialize;

    use super::*;
    use crate::consensus::NullScriptVerifier;
    use crate::test_utils::spend;
    use crate::test_utils::ChainBuilder;
    use crate::test_utils::MemoryBlockSource;
    use crate::test_utils::MemoryUtxoStore;
    use ibis_common::COIN_VALUE;

    fn setup(chain: &ChainBuilder) -> MemoryBlockSource {
        let mut source = MemoryBlockSource::default();
        for height in 1..=chain.tip_height() {
            source.add(height, serialize(&chain.block(height)));
        }
        source
    }

    #[test]
    fn validates_a_chunk_and_elides_short_lived_outputs() {
        let mut chain = ChainBuilder::new();
        let consensus = chain.consensus();

        // Enough empty blocks that the first coinbase is spendable
        for _ in 0..110 {
            chain.add_block(Vec::new());
        }
        // Output A: created by a transaction in block 111..
        let coinbase_1 = chain.block(1).txdata[0].compute_txid();
        let transfer = spend(coinbase_1, 0, &[20 * COIN_VALUE]);
        let transfer_txid = transfer.compute_txid();
        chain.add_block(vec![transfer]);
        // ..and spent again in block 115, within the same chunk
        for _ in 0..3 {
            chain.add_block(Vec::new());
        }
        chain.add_block(vec![spend(transfer_txid, 0, &[19 * COIN_VALUE])]);

        let source = setup(&chain);
        let utxos = MemoryUtxoStore::default();
        let scripts = NullScriptVerifier;
        let mut validator = ChunkValidator::new(
            &consensus,
            &source,
            &utxos,
            &scripts,
            1,
            chain.tip_height(),
            chain.genesis_hash(),
            0,
        );

        validator.run().unwrap();
        assert_eq!(validator.tip_hash(), chain.block(chain.tip_height()).block_hash());

        let batch = validator.into_batch();
        // Both the transfer output and the coinbase it spent were created
        // inside this chunk, so both spends were elided
        assert_eq!(batch.created_then_spent, 2);
        assert!(batch.spent().is_empty());
        // The short-lived transfer output is gone from the creates as well
        assert!(batch
            .created()
            .all(|(op, _)| op.txid != transfer_txid || op.vout != 0));
        assert!(batch.get_created(&bitcoin::OutPoint { txid: coinbase_1, vout: 0 }).is_none());
    }

    #[test]
    fn reports_the_failing_height() {
        let mut chain = ChainBuilder::new();
        let consensus = chain.consensus();
        for _ in 0..5 {
            chain.add_block(Vec::new());
        }

        let mut source = setup(&chain);
        // Corrupt block 4 by swapping in block 2's bytes
        source.add(4, serialize(&chain.block(2)));

        let utxos = MemoryUtxoStore::default();
        let scripts = NullScriptVerifier;
        let mut validator = ChunkValidator::new(
            &consensus,
            &source,
            &utxos,
            &scripts,
            1,
            5,
            chain.genesis_hash(),
            u32::MAX,
        );

        let err = validator.run().unwrap_err();
        assert!(matches!(err, BlockchainError::BlockValidation(_)));
        let chunk_error = validator.last_error().unwrap();
        assert_eq!(chunk_error.height, 4);
        assert!(matches!(
            chunk_error.error,
            BlockValidationErrors::BadPrevBlock { .. }
        ));
        assert_eq!(validator.next_height(), 4);
    }

    #[test]
    fn missing_block_is_not_a_consensus_failure() {
        let mut chain = ChainBuilder::new();
        let consensus = chain.consensus();
        chain.add_block(Vec::new());

        let source = MemoryBlockSource::default();
        let utxos = MemoryUtxoStore::default();
        let scripts = NullScriptVerifier;
        let mut validator = ChunkValidator::new(
            &consensus,
            &source,
            &utxos,
            &scripts,
            1,
            1,
            chain.genesis_hash(),
            u32::MAX,
        );

        let err = validator.validate_next().unwrap_err();
        assert!(matches!(err, BlockchainError::BlockNotFound(1)));
        // Not a block problem, so nothing is pinned on a height
        assert!(validator.last_error().is_none());
    }

    #[test]
    fn garbage_bytes_are_a_corrupt_file() {
        let chain = ChainBuilder::new();
        let consensus = chain.consensus();

        let mut source = MemoryBlockSource::default();
        source.add(1, vec![0xde, 0xad, 0xbe, 0xef]);

        let utxos = MemoryUtxoStore::default();
        let scripts = NullScriptVerifier;
        let mut validator = ChunkValidator::new(
            &consensus,
            &source,
            &utxos,
            &scripts,
            1,
            1,
            chain.genesis_hash(),
            u32::MAX,
        );

        let err = validator.validate_next().unwrap_err();
        assert!(matches!(
            err,
            BlockchainError::CorruptBlockFile { height: 1, length: 4 }
        ));
    }
}
