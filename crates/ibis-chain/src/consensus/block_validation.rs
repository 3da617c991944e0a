use bitcoin::Block;
use bitcoin::BlockHash;
use ibis_common::prelude::HashSet;

use super::Consensus;
use super::ScriptVerifier;
use crate::chainstore::UtxoView;
use crate::error::BlockValidationErrors;
use crate::error::BlockchainError;
use crate::utxo_batch::UtxoBatch;

impl Consensus {
    /// Fully validates one block against its position in the chain, resolving
    /// inputs through `batch` first and `utxos` second, and recording the
    /// block's UTXO effects into `batch`.
    ///
    /// `scripts` is `None` inside the assume-valid window, in which case
    /// everything except the scripts themselves is still checked.
    pub fn validate_block(
        &self,
        block: &Block,
        height: u32,
        prev_hash: BlockHash,
        batch: &mut UtxoBatch,
        utxos: &dyn UtxoView,
        scripts: Option<&dyn ScriptVerifier>,
    ) -> Result<(), BlockchainError> {
        if block.header.prev_blockhash != prev_hash {
            return Err(BlockValidationErrors::BadPrevBlock {
                expected: prev_hash,
                got: block.header.prev_blockhash,
            })?;
        }

        self.check_proof_of_work(&block.header)?;

        if !block.check_merkle_root() {
            return Err(BlockValidationErrors::BadMerkleRoot)?;
        }

        let bip34_height = self.parameters.params.bip34_height;
        // If bip34 is active, check that the encoded block height is correct
        if height >= bip34_height && self.get_bip34_height(block) != Some(height) {
            return Err(BlockValidationErrors::BadBip34)?;
        }

        if !block.check_witness_commitment() {
            return Err(BlockValidationErrors::BadWitnessCommitment)?;
        }

        if block.weight().to_wu() > self.parameters.max_block_weight {
            return Err(BlockValidationErrors::BlockTooBig)?;
        }

        Self::check_no_duplicate_spends(block)?;

        // Validate block transactions
        let subsidy = self.get_subsidy(height);
        self.verify_block_transactions(block, height, subsidy, batch, utxos, scripts)
    }

    /// No output may be spent twice by the same block, whichever transactions
    /// the two spends live in.
    fn check_no_duplicate_spends(block: &Block) -> Result<(), BlockValidationErrors> {
        let mut seen = HashSet::new();
        for transaction in block.txdata.iter().skip(1) {
            for input in &transaction.input {
                if !seen.insert(input.previous_output) {
                    return Err(BlockValidationErrors::DuplicateInput(input.previous_output));
                }
            }
        }
        Ok(())
    }

    /// Verify if all transactions in a block are valid. Here we check the following:
    /// - The block must contain at least one transaction, and this transaction must be coinbase
    /// - Only the first transaction in the block may be coinbase
    /// - Every input must spend an existing, mature output
    /// - The block must not create more coins than allowed
    /// - The coinbase must not claim more than subsidy plus fees
    pub fn verify_block_transactions(
        &self,
        block: &Block,
        height: u32,
        subsidy: u64,
        batch: &mut UtxoBatch,
        utxos: &dyn UtxoView,
        scripts: Option<&dyn ScriptVerifier>,
    ) -> Result<(), BlockchainError> {
        // Blocks must contain at least one transaction (i.e., the coinbase)
        if block.txdata.is_empty() {
            return Err(BlockValidationErrors::EmptyBlock)?;
        }

        // Total block fees that the miner can claim in the coinbase
        let mut fee = 0;

        for (n, transaction) in block.txdata.iter().enumerate() {
            batch.txs += 1;
            let txid = transaction.compute_txid();

            if n == 0 {
                if !transaction.is_coinbase() {
                    return Err(BlockValidationErrors::FirstTxIsNotCoinbase)?;
                }
                // Coinbase outputs enter the UTXO set like any other; the
                // reward check happens after the fees are known
                self.process_outputs(transaction, txid, height, true, batch)?;
                continue;
            }

            // Actually verify the transaction
            let (in_value, out_value) =
                self.verify_transaction(transaction, txid, height, batch, utxos, scripts)?;

            // Fee is the difference between inputs and outputs
            fee += in_value - out_value;
        }

        // Check coinbase output values to ensure the miner isn't producing excess coins
        let allowed_reward = fee + subsidy;
        let coinbase_total: u64 = block.txdata[0]
            .output
            .iter()
            .map(|out| out.value.to_sat())
            .sum();

        if coinbase_total > allowed_reward {
            return Err(BlockValidationErrors::BadCoinbaseOutValue)?;
        }

        Ok(())
    }
}
