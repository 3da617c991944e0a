//! The in-memory header chain built during the headers phase of initial
//! block download.
//!
//! During IBD we follow a single best chain: headers must extend the current
//! tip, one by one, each carrying a sane proof-of-work commitment. Fork
//! choice between competing tips is a steady-state concern and doesn't come
//! up while we're months behind the network.

use std::collections::HashMap;

use bitcoin::block::Header as BlockHeader;
use bitcoin::constants::genesis_block;
use bitcoin::pow::Work;
use bitcoin::BlockHash;

use crate::chainstore::BlockIndexEntry;
use crate::chainstore::BlockStatus;
use crate::consensus::Consensus;
use crate::error::BlockValidationErrors;
use crate::error::BlockchainError;

pub struct HeaderChain {
    consensus: Consensus,
    /// Every known header with its hash and the cumulative work up to it,
    /// indexed by height. Entry zero is genesis.
    headers: Vec<(BlockHeader, BlockHash, Work)>,
    heights: HashMap<BlockHash, u32>,
}

impl HeaderChain {
    pub fn new(consensus: Consensus) -> Self {
        let genesis = genesis_block(consensus.parameters.network);
        let hash = genesis.block_hash();
        let work = genesis.header.work();

        let mut heights = HashMap::new();
        heights.insert(hash, 0);

        HeaderChain {
            consensus,
            headers: vec![(genesis.header, hash, work)],
            heights,
        }
    }

    pub fn tip_height(&self) -> u32 {
        self.headers.len() as u32 - 1
    }

    pub fn tip_hash(&self) -> BlockHash {
        self.headers.last().expect("genesis is always present").1
    }

    pub fn total_work(&self) -> Work {
        self.headers.last().expect("genesis is always present").2
    }

    pub fn hash_at(&self, height: u32) -> Option<BlockHash> {
        self.headers.get(height as usize).map(|(_, hash, _)| *hash)
    }

    pub fn header_at(&self, height: u32) -> Option<&BlockHeader> {
        self.headers.get(height as usize).map(|(header, _, _)| header)
    }

    pub fn height_of(&self, hash: &BlockHash) -> Option<u32> {
        self.heights.get(hash).copied()
    }

    /// Accepts one header extending the tip. Re-announcements of known
    /// headers are fine and return their existing height.
    pub fn accept_header(&mut self, header: BlockHeader) -> Result<u32, BlockchainError> {
        let hash = header.block_hash();
        if let Some(height) = self.heights.get(&hash) {
            return Ok(*height);
        }

        if header.prev_blockhash != self.tip_hash() {
            return Err(BlockValidationErrors::BadPrevBlock {
                expected: self.tip_hash(),
                got: header.prev_blockhash,
            })?;
        }

        self.consensus.check_proof_of_work(&header)?;

        let height = self.tip_height() + 1;
        let total_work = self.total_work() + header.work();
        self.headers.push((header, hash, total_work));
        self.heights.insert(hash, height);
        Ok(height)
    }

    /// A block locator for `getheaders`: dense near the tip, exponentially
    /// thinning towards genesis, genesis-terminated.
    pub fn locator(&self) -> Vec<BlockHash> {
        let mut locator = Vec::new();
        let mut height = self.tip_height();
        let mut step = 1u32;

        loop {
            locator.push(self.headers[height as usize].1);
            if height == 0 {
                break;
            }
            if locator.len() >= 10 {
                step *= 2;
            }
            height = height.saturating_sub(step);
        }
        locator
    }

    /// The index entry to persist for the header at `height`.
    pub fn index_entry(&self, height: u32) -> Option<BlockIndexEntry> {
        let (header, _, total_work) = self.headers.get(height as usize)?;
        let mut status = BlockStatus::default();
        status.insert(BlockStatus::VALID_HEADER);

        Some(BlockIndexEntry {
            header: *header,
            height,
            status,
            total_work: *total_work,
        })
    }
}
