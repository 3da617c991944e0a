//! Storage traits and on-disk record types for the two chainstate databases:
//! the UTXO set keyed by outpoint, and the block index keyed by hash and by
//! height.

pub mod kv_chainstore;

use bitcoin::block::Header as BlockHeader;
use bitcoin::consensus::deserialize;
use bitcoin::consensus::serialize;
use bitcoin::pow::Work;
use bitcoin::BlockHash;
use bitcoin::OutPoint;
use bitcoin::ScriptBuf;

use crate::error::BlockchainError;
use crate::utxo_batch::UtxoBatch;

/// One unspent transaction output, as stored in the UTXO database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoEntry {
    /// Value in satoshis.
    pub value: u64,
    /// The locking script.
    pub script_pubkey: ScriptBuf,
    /// Height of the block that confirmed this output.
    pub height: u32,
    /// Coinbase outputs can only be spent a hundred blocks later.
    pub is_coinbase: bool,
}

impl UtxoEntry {
    /// On-disk layout: value (8 LE) | height (4 LE) | coinbase flag (1) | script.
    pub fn to_bytes(&self) -> Vec<u8> {
        let script = self.script_pubkey.as_bytes();
        let mut bytes = Vec::with_capacity(13 + script.len());
        bytes.extend_from_slice(&self.value.to_le_bytes());
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.push(self.is_coinbase as u8);
        bytes.extend_from_slice(script);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 13 {
            return None;
        }
        let value = u64::from_le_bytes(bytes[0..8].try_into().ok()?);
        let height = u32::from_le_bytes(bytes[8..12].try_into().ok()?);
        let is_coinbase = bytes[12] != 0;
        let script_pubkey = ScriptBuf::from(bytes[13..].to_vec());
        Some(UtxoEntry {
            value,
            script_pubkey,
            height,
            is_coinbase,
        })
    }
}

/// Validation and storage state of one block in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockStatus(u8);

impl BlockStatus {
    pub const VALID_HEADER: BlockStatus = BlockStatus(1);
    pub const VALID_TREE: BlockStatus = BlockStatus(1 << 1);
    pub const VALID_SCRIPTS: BlockStatus = BlockStatus(1 << 2);
    pub const VALID_CHAIN: BlockStatus = BlockStatus(1 << 3);
    pub const HAVE_DATA: BlockStatus = BlockStatus(1 << 4);
    pub const PRUNED: BlockStatus = BlockStatus(1 << 5);
    pub const FAILED: BlockStatus = BlockStatus(1 << 6);

    pub fn contains(self, flags: BlockStatus) -> bool {
        self.0 & flags.0 == flags.0
    }

    /// Sets the given flags. `PRUNED` and `HAVE_DATA` are mutually exclusive,
    /// so setting one clears the other.
    pub fn insert(&mut self, flags: BlockStatus) {
        if flags.contains(Self::PRUNED) {
            self.0 &= !Self::HAVE_DATA.0;
        }
        if flags.contains(Self::HAVE_DATA) {
            self.0 &= !Self::PRUNED.0;
        }
        self.0 |= flags.0;
    }

    pub fn remove(&mut self, flags: BlockStatus) {
        self.0 &= !flags.0;
    }

    pub fn to_byte(self) -> u8 {
        self.0
    }

    pub fn from_byte(byte: u8) -> Self {
        BlockStatus(byte)
    }
}

/// One entry of the block index: a header plus everything we know about the
/// block it commits to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndexEntry {
    pub header: BlockHeader,
    pub height: u32,
    pub status: BlockStatus,
    /// Cumulative proof of work up to and including this block.
    pub total_work: Work,
}

impl BlockIndexEntry {
    pub fn block_hash(&self) -> BlockHash {
        self.header.block_hash()
    }

    /// On-disk layout: header (80) | height (4 LE) | status (1) | work (32 BE).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(117);
        bytes.extend_from_slice(&serialize(&self.header));
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.push(self.status.to_byte());
        bytes.extend_from_slice(&self.total_work.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 117 {
            return None;
        }
        let header = deserialize(&bytes[0..80]).ok()?;
        let height = u32::from_le_bytes(bytes[80..84].try_into().ok()?);
        let status = BlockStatus::from_byte(bytes[84]);
        let total_work = Work::from_be_bytes(bytes[85..117].try_into().ok()?);
        Some(BlockIndexEntry {
            header,
            height,
            status,
            total_work,
        })
    }
}

/// What happened during one [UtxoStore::apply_batch] call. Re-running a flush
/// after a crash hits the `already_*` counters instead of failing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub inserted: u64,
    pub deleted: u64,
    pub already_present: u64,
    pub already_absent: u64,
}

/// The UTXO database. A single writer applies one chunk's worth of changes
/// per transaction; readers see either all of a chunk or none of it.
pub trait UtxoStore {
    type Error: std::fmt::Display;

    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, Self::Error>;

    /// Applies every spend and every creation of a validated chunk in one
    /// database transaction. Either the whole batch commits or none of it.
    fn apply_batch(&mut self, batch: &UtxoBatch) -> Result<FlushStats, Self::Error>;

    /// A durability fence, called every checkpoint interval to bound how much
    /// the database keeps buffered.
    fn checkpoint(&mut self) -> Result<(), Self::Error>;
}

/// The block index database, keyed by hash with a height-to-hash side table.
pub trait BlockIndexStore {
    type Error: std::fmt::Display;

    fn get_entry(&self, hash: &BlockHash) -> Result<Option<BlockIndexEntry>, Self::Error>;
    fn get_entry_by_height(&self, height: u32) -> Result<Option<BlockIndexEntry>, Self::Error>;
    fn get_block_hash(&self, height: u32) -> Result<Option<BlockHash>, Self::Error>;
    fn save_entry(&mut self, entry: &BlockIndexEntry) -> Result<(), Self::Error>;
    fn update_block_index(&mut self, height: u32, hash: BlockHash) -> Result<(), Self::Error>;

    /// The validated tip, i.e. the highest height whose effects are committed
    /// to the UTXO database.
    fn load_height(&self) -> Result<Option<u32>, Self::Error>;
    fn save_height(&mut self, height: u32) -> Result<(), Self::Error>;

    /// The lowest height whose block file is still on disk, if pruning ever ran.
    fn pruned_height(&self) -> Result<Option<u32>, Self::Error>;

    /// Marks every block at `height <= up_to` as pruned, clearing `HAVE_DATA`,
    /// and records `up_to + 1` as the pruned height. Returns how many entries
    /// changed.
    fn mark_pruned(&mut self, up_to: u32) -> Result<u64, Self::Error>;
}

/// Object-safe read access to the UTXO set, used by the validator to resolve
/// inputs that are not satisfied by the in-flight chunk batch.
pub trait UtxoView {
    fn lookup(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, BlockchainError>;
}
