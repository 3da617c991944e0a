//! redb-backed implementations of the two chainstate databases. Each write
//! commits its own transaction, so a crash can never leave half a chunk
//! applied.

use std::num::NonZeroUsize;
use std::path::Path;

use bitcoin::consensus::deserialize;
use bitcoin::consensus::serialize;
use bitcoin::BlockHash;
use bitcoin::OutPoint;
use lru::LruCache;
use redb::{Database, Error as RedbError, TableDefinition};
use spin::Mutex;

use crate::chainstore::BlockIndexEntry;
use crate::chainstore::BlockIndexStore;
use crate::chainstore::BlockStatus;
use crate::chainstore::FlushStats;
use crate::chainstore::UtxoEntry;
use crate::chainstore::UtxoStore;
use crate::utxo_batch::UtxoBatch;

const UTXOS_TABLE: TableDefinition<'static, &'static [u8], &'static [u8]> =
    TableDefinition::new("utxos");

const HEADERS_TABLE: TableDefinition<'static, &'static [u8], &'static [u8]> =
    TableDefinition::new("headers");

const INDEX_TABLE: TableDefinition<'static, u32, &'static [u8]> = TableDefinition::new("index");

const META_TABLE: TableDefinition<'static, &'static str, &'static [u8]> =
    TableDefinition::new("meta");

// Tune these numbers to your memory / perf target
const UTXO_CACHE_CAPACITY: usize = 128_000;
const HEADER_CACHE_CAPACITY: usize = 64_000;
const INDEX_CACHE_CAPACITY: usize = 64_000;

/// The UTXO set at `{data_dir}/chainstate/utxo.redb`.
pub struct KvUtxoStore {
    db: Database,

    // LRU cache in front of the database. Interior mutability so we can
    // mutate it from &self.
    cache: Mutex<LruCache<OutPoint, UtxoEntry>>,
}

impl KvUtxoStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self, RedbError> {
        let chainstate = data_dir.as_ref().join("chainstate");
        std::fs::create_dir_all(&chainstate).expect("Failed to create dir");
        let db = Database::create(chainstate.join("utxo.redb"))?;

        // Pre-create tables so later open_table() calls cannot fail with "table not found".
        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(UTXOS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::try_from(UTXO_CACHE_CAPACITY).unwrap(),
            )),
        })
    }
}

impl UtxoStore for KvUtxoStore {
    type Error = RedbError;

    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, Self::Error> {
        // Fast path: check the LRU cache
        {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.get(outpoint) {
                return Ok(Some(entry.clone()));
            }
        }

        // Slow path: go to the DB
        let key = serialize(outpoint);

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(UTXOS_TABLE)?;

        if let Some(value) = table.get(key.as_slice())? {
            if let Some(entry) = UtxoEntry::from_bytes(value.value()) {
                // Populate the cache on a DB hit
                let mut cache = self.cache.lock();
                cache.put(*outpoint, entry.clone());
                Ok(Some(entry))
            } else {
                Ok(None)
            }
        } else {
            Ok(None)
        }
    }

    fn apply_batch(&mut self, batch: &UtxoBatch) -> Result<FlushStats, Self::Error> {
        let mut stats = FlushStats::default();

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(UTXOS_TABLE)?;

            for outpoint in batch.spent() {
                let key = serialize(outpoint);
                match table.remove(key.as_slice())? {
                    // A delete that finds nothing means a previous run of this
                    // same flush already removed it
                    Some(_) => stats.deleted += 1,
                    None => stats.already_absent += 1,
                }
            }

            for (outpoint, entry) in batch.created() {
                let key = serialize(outpoint);
                let value = entry.to_bytes();
                match table.insert(key.as_slice(), value.as_slice())? {
                    Some(_) => stats.already_present += 1,
                    None => stats.inserted += 1,
                }
            }
        }
        write_txn.commit()?;

        // Only touch the cache once the transaction is durable
        let mut cache = self.cache.lock();
        for outpoint in batch.spent() {
            cache.pop(outpoint);
        }
        for (outpoint, entry) in batch.created() {
            cache.put(*outpoint, entry.clone());
        }

        Ok(stats)
    }

    fn checkpoint(&mut self) -> Result<(), Self::Error> {
        // For this backend, every write creates its own transaction and
        // commits, so there's nothing buffered to flush here. The trait call
        // stays because other backends do accumulate a log.
        Ok(())
    }
}

impl crate::chainstore::UtxoView for KvUtxoStore {
    fn lookup(
        &self,
        outpoint: &OutPoint,
    ) -> Result<Option<UtxoEntry>, crate::error::BlockchainError> {
        self.get_utxo(outpoint)
            .map_err(|e| crate::error::BlockchainError::Database(e.to_string()))
    }
}

/// The block index at `{data_dir}/chainstate/blocks.redb`.
pub struct KvBlockIndex {
    db: Database,

    header_cache: Mutex<LruCache<BlockHash, BlockIndexEntry>>,
    index_cache: Mutex<LruCache<u32, BlockHash>>,
}

impl KvBlockIndex {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self, RedbError> {
        let chainstate = data_dir.as_ref().join("chainstate");
        std::fs::create_dir_all(&chainstate).expect("Failed to create dir");
        let db = Database::create(chainstate.join("blocks.redb"))?;

        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(HEADERS_TABLE)?;
            write_txn.open_table(INDEX_TABLE)?;
            write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db,
            header_cache: Mutex::new(LruCache::new(
                NonZeroUsize::try_from(HEADER_CACHE_CAPACITY).unwrap(),
            )),
            index_cache: Mutex::new(LruCache::new(
                NonZeroUsize::try_from(INDEX_CACHE_CAPACITY).unwrap(),
            )),
        })
    }

    fn load_meta_height(&self, key: &str) -> Result<Option<u32>, RedbError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;

        if let Some(entry) = table.get(key)? {
            let bytes: [u8; 4] = entry
                .value()
                .try_into()
                .expect("infallible: came from `to_le_bytes`");
            Ok(Some(u32::from_le_bytes(bytes)))
        } else {
            Ok(None)
        }
    }

    fn save_meta_height(&mut self, key: &str, height: u32) -> Result<(), RedbError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            table.insert(key, height.to_le_bytes().as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl BlockIndexStore for KvBlockIndex {
    type Error = RedbError;

    fn get_entry(&self, hash: &BlockHash) -> Result<Option<BlockIndexEntry>, Self::Error> {
        // Fast path: check the LRU cache
        {
            let mut cache = self.header_cache.lock();
            if let Some(entry) = cache.get(hash) {
                return Ok(Some(entry.clone()));
            }
        }

        let key = serialize(hash);

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(HEADERS_TABLE)?;

        if let Some(value) = table.get(key.as_slice())? {
            if let Some(entry) = BlockIndexEntry::from_bytes(value.value()) {
                let mut cache = self.header_cache.lock();
                cache.put(*hash, entry.clone());
                Ok(Some(entry))
            } else {
                Ok(None)
            }
        } else {
            Ok(None)
        }
    }

    fn get_entry_by_height(&self, height: u32) -> Result<Option<BlockIndexEntry>, Self::Error> {
        if let Some(hash) = self.get_block_hash(height)? {
            self.get_entry(&hash)
        } else {
            Ok(None)
        }
    }

    fn get_block_hash(&self, height: u32) -> Result<Option<BlockHash>, Self::Error> {
        // Fast path: LRU cache
        {
            let mut cache = self.index_cache.lock();
            if let Some(hash) = cache.get(&height) {
                return Ok(Some(*hash));
            }
        }

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(INDEX_TABLE)?;

        if let Some(entry) = table.get(height)? {
            let bytes = entry.value();
            if let Ok(hash) = deserialize::<BlockHash>(bytes) {
                let mut cache = self.index_cache.lock();
                cache.put(height, hash);
                Ok(Some(hash))
            } else {
                Ok(None)
            }
        } else {
            Ok(None)
        }
    }

    fn save_entry(&mut self, entry: &BlockIndexEntry) -> Result<(), Self::Error> {
        let hash = entry.block_hash();

        // Update the LRU cache immediately
        {
            let mut cache = self.header_cache.lock();
            cache.put(hash, entry.clone());
        }

        // Write directly to the DB (canonical store)
        let key = serialize(&hash);
        let value = entry.to_bytes();

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(HEADERS_TABLE)?;
            table.insert(key.as_slice(), value.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn update_block_index(&mut self, height: u32, hash: BlockHash) -> Result<(), Self::Error> {
        {
            let mut cache = self.index_cache.lock();
            cache.put(height, hash);
        }

        let value = serialize(&hash);

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(INDEX_TABLE)?;
            table.insert(height, value.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_height(&self) -> Result<Option<u32>, Self::Error> {
        self.load_meta_height("height")
    }

    fn save_height(&mut self, height: u32) -> Result<(), Self::Error> {
        self.save_meta_height("height", height)
    }

    fn pruned_height(&self) -> Result<Option<u32>, Self::Error> {
        self.load_meta_height("pruned")
    }

    fn mark_pruned(&mut self, up_to: u32) -> Result<u64, Self::Error> {
        let start = self.pruned_height()?.unwrap_or(0);
        let mut changed = 0;

        for height in start..=up_to {
            let Some(hash) = self.get_block_hash(height)? else {
                continue;
            };
            let Some(mut entry) = self.get_entry(&hash)? else {
                continue;
            };
            if entry.status.contains(BlockStatus::PRUNED) {
                continue;
            }
            entry.status.insert(BlockStatus::PRUNED);
            self.save_entry(&entry)?;
            changed += 1;
        }

        self.save_meta_height("pruned", up_to + 1)?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;
    use bitcoin::ScriptBuf;
    use bitcoin::Txid;

    use super::*;
    use crate::utxo_batch::UtxoBatch;

    fn outpoint(n: u8, vout: u32) -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array([n; 32]),
            vout,
        }
    }

    fn entry(value: u64, height: u32) -> UtxoEntry {
        UtxoEntry {
            value,
            script_pubkey: ScriptBuf::from(vec![0x51]),
            height,
            is_coinbase: false,
        }
    }

    #[test]
    fn utxo_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = KvUtxoStore::new(dir.path()).unwrap();

        let mut batch = UtxoBatch::new(1, 1);
        batch.create(outpoint(1, 0), entry(100, 1));
        batch.create(outpoint(1, 1), entry(200, 1));

        let stats = store.apply_batch(&batch).unwrap();
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.deleted, 0);

        assert_eq!(store.get_utxo(&outpoint(1, 0)).unwrap(), Some(entry(100, 1)));
        assert_eq!(store.get_utxo(&outpoint(1, 1)).unwrap(), Some(entry(200, 1)));
        assert_eq!(store.get_utxo(&outpoint(2, 0)).unwrap(), None);
    }

    #[test]
    fn reapplying_a_batch_is_benign() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = KvUtxoStore::new(dir.path()).unwrap();

        let mut setup = UtxoBatch::new(1, 1);
        setup.create(outpoint(1, 0), entry(100, 1));
        store.apply_batch(&setup).unwrap();

        // A batch that spends the existing output and creates a new one
        let mut batch = UtxoBatch::new(2, 2);
        batch.spend(outpoint(1, 0), &store).unwrap().unwrap();
        batch.create(outpoint(2, 0), entry(50, 2));

        let first = store.apply_batch(&batch).unwrap();
        assert_eq!(first.deleted, 1);
        assert_eq!(first.inserted, 1);

        // Re-running the same flush, as a crashed node would on restart
        let second = store.apply_batch(&batch).unwrap();
        assert_eq!(second.deleted, 0);
        assert_eq!(second.already_absent, 1);
        assert_eq!(second.already_present, 1);

        assert_eq!(store.get_utxo(&outpoint(1, 0)).unwrap(), None);
        assert!(store.get_utxo(&outpoint(2, 0)).unwrap().is_some());
    }

    #[test]
    fn block_index_prune_marks() {
        use bitcoin::block::Header as BlockHeader;
        use bitcoin::BlockHash;
        use bitcoin::CompactTarget;
        use bitcoin::TxMerkleNode;

        let dir = tempfile::tempdir().unwrap();
        let mut index = KvBlockIndex::new(dir.path()).unwrap();

        let mut prev = BlockHash::all_zeros();
        for height in 0..10u32 {
            let header = BlockHeader {
                version: bitcoin::block::Version::TWO,
                prev_blockhash: prev,
                merkle_root: TxMerkleNode::all_zeros(),
                time: height,
                bits: CompactTarget::from_consensus(0x207f_ffff),
                nonce: 0,
            };
            let mut status = BlockStatus::default();
            status.insert(BlockStatus::VALID_HEADER);
            status.insert(BlockStatus::HAVE_DATA);
            let entry = BlockIndexEntry {
                header,
                height,
                status,
                total_work: header.work(),
            };
            index.save_entry(&entry).unwrap();
            index.update_block_index(height, entry.block_hash()).unwrap();
            prev = entry.block_hash();
        }

        assert_eq!(index.pruned_height().unwrap(), None);
        let changed = index.mark_pruned(4).unwrap();
        assert_eq!(changed, 5);
        assert_eq!(index.pruned_height().unwrap(), Some(5));

        for height in 0..=4 {
            let entry = index.get_entry_by_height(height).unwrap().unwrap();
            assert!(entry.status.contains(BlockStatus::PRUNED));
            assert!(!entry.status.contains(BlockStatus::HAVE_DATA));
        }
        for height in 5..10 {
            let entry = index.get_entry_by_height(height).unwrap().unwrap();
            assert!(entry.status.contains(BlockStatus::HAVE_DATA));
        }

        // Pruning further is incremental
        let changed = index.mark_pruned(6).unwrap();
        assert_eq!(changed, 2);
        assert_eq!(index.pruned_height().unwrap(), Some(7));
    }

    #[test]
    fn best_height_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = KvBlockIndex::new(dir.path()).unwrap();

        assert_eq!(index.load_height().unwrap(), None);
        index.save_height(123).unwrap();
        assert_eq!(index.load_height().unwrap(), Some(123));
        index.save_height(124).unwrap();
        assert_eq!(index.load_height().unwrap(), Some(124));
    }
}
