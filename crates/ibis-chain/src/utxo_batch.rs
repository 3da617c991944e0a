//! The transient UTXO delta built while validating one chunk of blocks.
//!
//! Outputs created and spent within the same chunk never reach the database:
//! spending an outpoint that is still in the created-set removes it there
//! instead of recording a delete. Everything that survives until the end of
//! the chunk is applied to the UTXO database in a single transaction.

use bitcoin::OutPoint;
use ibis_common::prelude::HashMap;
use ibis_common::prelude::HashSet;

use crate::chainstore::UtxoEntry;
use crate::chainstore::UtxoView;
use crate::error::BlockchainError;

#[derive(Debug, Default)]
pub struct UtxoBatch {
    /// Outputs created in this chunk and not yet spent by it.
    created: HashMap<OutPoint, UtxoEntry>,
    /// Outputs that existed before this chunk and were spent by it, in spend
    /// order.
    spent: Vec<OutPoint>,
    /// Same set as `spent`, for O(1) double-spend detection across blocks.
    spent_set: HashSet<OutPoint>,

    pub txs: u64,
    pub inputs: u64,
    pub outputs: u64,
    pub created_then_spent: u64,

    chunk_start: u32,
    chunk_end: u32,
}

impl UtxoBatch {
    pub fn new(chunk_start: u32, chunk_end: u32) -> Self {
        UtxoBatch {
            chunk_start,
            chunk_end,
            ..Default::default()
        }
    }

    pub fn chunk_start(&self) -> u32 {
        self.chunk_start
    }

    pub fn chunk_end(&self) -> u32 {
        self.chunk_end
    }

    /// Records a newly created output.
    pub fn create(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        self.outputs += 1;
        self.created.insert(outpoint, entry);
    }

    /// Resolves and consumes the output an input spends: first from this
    /// chunk's created-set, then from the database. Returns `None` when the
    /// outpoint is unknown or was already spent inside this chunk.
    pub fn spend(
        &mut self,
        outpoint: OutPoint,
        db: &dyn UtxoView,
    ) -> Result<Option<UtxoEntry>, BlockchainError> {
        self.inputs += 1;

        if let Some(entry) = self.created.remove(&outpoint) {
            self.created_then_spent += 1;
            return Ok(Some(entry));
        }

        if self.spent_set.contains(&outpoint) {
            return Ok(None);
        }

        match db.lookup(&outpoint)? {
            Some(entry) => {
                self.spent.push(outpoint);
                self.spent_set.insert(outpoint);
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Peeks at an output without consuming it.
    pub fn get_created(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.created.get(outpoint)
    }

    /// Outputs to insert into the database at flush time.
    pub fn created(&self) -> impl Iterator<Item = (&OutPoint, &UtxoEntry)> {
        self.created.iter()
    }

    /// Outpoints to delete from the database at flush time, in spend order.
    pub fn spent(&self) -> &[OutPoint] {
        &self.spent
    }

    /// How many distinct records a flush of this batch touches.
    pub fn db_touch_count(&self) -> usize {
        self.created.len() + self.spent.len()
    }
}
