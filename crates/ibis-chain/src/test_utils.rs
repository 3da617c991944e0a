//! Helpers for building small regtest chains in tests. Everything here mines
//! real proof of work against the regtest limit, which takes a handful of
//! hash attempts per block.

use std::collections::HashMap;

use bitcoin::absolute;
use bitcoin::constants::genesis_block;
use bitcoin::script::Builder;
use bitcoin::transaction;
use bitcoin::Amount;
use bitcoin::Block;
use bitcoin::BlockHash;
use bitcoin::Network;
use bitcoin::OutPoint;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::Transaction;
use bitcoin::TxIn;
use bitcoin::TxOut;
use bitcoin::Txid;
use bitcoin::Witness;

use crate::chainparams::ChainParams;
use crate::chainstore::FlushStats;
use crate::chainstore::UtxoEntry;
use crate::chainstore::UtxoStore;
use crate::chainstore::UtxoView;
use crate::chunk_validator::BlockSource;
use crate::consensus::Consensus;
use crate::error::BlockchainError;
use crate::utxo_batch::UtxoBatch;

/// Encodes a height the way `CScript() << nHeight` does, which is what the
/// BIP-34 parser accepts.
pub fn encode_height(height: u32) -> ScriptBuf {
    Builder::new().push_int(height as i64).into_script()
}

/// An output anyone can spend, for test transactions.
pub fn anyone_can_spend() -> ScriptBuf {
    ScriptBuf::from(vec![0x51])
}

/// A transaction spending `(txid, vout)` into outputs of the given values.
pub fn spend(txid: Txid, vout: u32, values: &[u64]) -> Transaction {
    Transaction {
        version: transaction::Version::ONE,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint { txid, vout },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: values
            .iter()
            .map(|&value| TxOut {
                value: Amount::from_sat(value),
                script_pubkey: anyone_can_spend(),
            })
            .collect(),
    }
}

/// Recommits the merkle root and grinds the nonce until the header meets its
/// own target. At the regtest limit this loops about twice.
pub fn mine_block(consensus: &Consensus, mut block: Block) -> Block {
    block.header.merkle_root = block
        .compute_merkle_root()
        .expect("test blocks always have transactions");
    while consensus.check_proof_of_work(&block.header).is_err() {
        block.header.nonce += 1;
    }
    block
}

/// Grows a regtest chain block by block, from the real regtest genesis.
pub struct ChainBuilder {
    consensus: Consensus,
    blocks: Vec<Block>,
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainBuilder {
    pub fn new() -> Self {
        ChainBuilder {
            consensus: Consensus::new(ChainParams::from(Network::Regtest)),
            blocks: vec![genesis_block(Network::Regtest)],
        }
    }

    pub fn consensus(&self) -> Consensus {
        self.consensus.clone()
    }

    pub fn tip_height(&self) -> u32 {
        self.blocks.len() as u32 - 1
    }

    pub fn tip_hash(&self) -> BlockHash {
        self.blocks.last().unwrap().block_hash()
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.blocks[0].block_hash()
    }

    pub fn block(&self, height: u32) -> Block {
        self.blocks[height as usize].clone()
    }

    pub fn hash_at(&self, height: u32) -> BlockHash {
        self.blocks[height as usize].block_hash()
    }

    /// Headers above genesis, in height order.
    pub fn headers(&self) -> Vec<bitcoin::block::Header> {
        self.blocks[1..].iter().map(|block| block.header).collect()
    }

    /// Appends a block paying the miner exactly the subsidy.
    pub fn add_block(&mut self, transactions: Vec<Transaction>) -> &Block {
        let height = self.tip_height() + 1;
        let reward = self.consensus.get_subsidy(height);
        self.add_block_with_reward(transactions, reward)
    }

    /// Appends a block with an arbitrary coinbase claim, for tests that want
    /// an invalid reward.
    pub fn add_block_with_reward(
        &mut self,
        transactions: Vec<Transaction>,
        reward: u64,
    ) -> &Block {
        let height = self.tip_height() + 1;

        let coinbase = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: encode_height(height),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(reward),
                script_pubkey: anyone_can_spend(),
            }],
        };

        let mut txdata = vec![coinbase];
        txdata.extend(transactions);

        let genesis = &self.blocks[0];
        let header = bitcoin::block::Header {
            version: bitcoin::block::Version::TWO,
            prev_blockhash: self.tip_hash(),
            merkle_root: genesis.header.merkle_root, // replaced by mine_block
            time: genesis.header.time + height,
            bits: genesis.header.bits,
            nonce: 0,
        };

        let block = mine_block(&self.consensus, Block { header, txdata });
        self.blocks.push(block);
        self.blocks.last().unwrap()
    }
}

/// A UTXO set held in a hash map. `fail_flushes` makes every flush attempt
/// error without touching anything, for atomicity tests.
#[derive(Default)]
pub struct MemoryUtxoStore {
    utxos: HashMap<OutPoint, UtxoEntry>,
    pub fail_flushes: bool,
}

impl MemoryUtxoStore {
    pub fn add(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        self.utxos.insert(outpoint, entry);
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.utxos.contains_key(outpoint)
    }
}

impl UtxoStore for MemoryUtxoStore {
    type Error = String;

    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, Self::Error> {
        Ok(self.utxos.get(outpoint).cloned())
    }

    fn apply_batch(&mut self, batch: &UtxoBatch) -> Result<FlushStats, Self::Error> {
        if self.fail_flushes {
            return Err("injected flush failure".to_string());
        }
        let mut stats = FlushStats::default();
        for outpoint in batch.spent() {
            match self.utxos.remove(outpoint) {
                Some(_) => stats.deleted += 1,
                None => stats.already_absent += 1,
            }
        }
        for (outpoint, entry) in batch.created() {
            match self.utxos.insert(*outpoint, entry.clone()) {
                Some(_) => stats.already_present += 1,
                None => stats.inserted += 1,
            }
        }
        Ok(stats)
    }

    fn checkpoint(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl UtxoView for MemoryUtxoStore {
    fn lookup(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, BlockchainError> {
        Ok(self.utxos.get(outpoint).cloned())
    }
}

/// Raw blocks held in a hash map, standing in for the block store.
#[derive(Default)]
pub struct MemoryBlockSource {
    blocks: HashMap<u32, Vec<u8>>,
}

impl MemoryBlockSource {
    pub fn add(&mut self, height: u32, bytes: Vec<u8>) {
        self.blocks.insert(height, bytes);
    }
}

impl BlockSource for MemoryBlockSource {
    fn load_block(&self, height: u32) -> Result<Vec<u8>, BlockchainError> {
        self.blocks
            .get(&height)
            .cloned()
            .ok_or(BlockchainError::BlockNotFound(height))
    }
}
