use bitcoin::OutPoint;
use bitcoin::Transaction;
use bitcoin::Txid;

use super::Consensus;
use super::ScriptVerifier;
use super::MAX_MONEY;
use crate::chainstore::UtxoEntry;
use crate::chainstore::UtxoView;
use crate::error::BlockValidationErrors;
use crate::error::BlockchainError;
use crate::utxo_batch::UtxoBatch;

impl Consensus {
    /// Verifies one non-coinbase transaction: every input must resolve to an
    /// existing, mature output, and the outputs must not exceed the inputs.
    /// Returns `(in_value, out_value)` so the caller can accumulate fees.
    pub(crate) fn verify_transaction(
        &self,
        transaction: &Transaction,
        txid: Txid,
        height: u32,
        batch: &mut UtxoBatch,
        utxos: &dyn UtxoView,
        scripts: Option<&dyn ScriptVerifier>,
    ) -> Result<(u64, u64), BlockchainError> {
        let mut in_value = 0u64;

        for (index, input) in transaction.input.iter().enumerate() {
            let outpoint = input.previous_output;

            // A null prevout outside the coinbase is a fake mint attempt
            if outpoint == OutPoint::null() {
                return Err(BlockValidationErrors::ExtraCoinbase)?;
            }

            let Some(spent) = batch.spend(outpoint, utxos)? else {
                return Err(BlockValidationErrors::UtxoNotFound(outpoint))?;
            };

            if spent.is_coinbase && !self.is_coinbase_mature(spent.height, height) {
                return Err(BlockValidationErrors::ImmatureCoinbaseSpend {
                    created: spent.height,
                    spent: height,
                })?;
            }

            in_value += spent.value;

            if let Some(verifier) = scripts {
                verifier
                    .verify_input(transaction, index, &spent)
                    .map_err(BlockValidationErrors::ScriptValidation)?;
            }
        }

        let out_value = self.process_outputs(transaction, txid, height, false, batch)?;

        if out_value > in_value {
            return Err(BlockValidationErrors::OutputsExceedInputs)?;
        }

        Ok((in_value, out_value))
    }

    /// Range-checks a transaction's outputs and records the spendable ones in
    /// the batch. Returns the total output value.
    pub(crate) fn process_outputs(
        &self,
        transaction: &Transaction,
        txid: Txid,
        height: u32,
        is_coinbase: bool,
        batch: &mut UtxoBatch,
    ) -> Result<u64, BlockchainError> {
        let mut total = 0u64;

        for (vout, output) in transaction.output.iter().enumerate() {
            let value = output.value.to_sat();
            if value > MAX_MONEY {
                return Err(BlockValidationErrors::BadOutputValue(value))?;
            }
            total += value;

            // OP_RETURN outputs are provably unspendable and never enter the set
            if output.script_pubkey.is_op_return() {
                continue;
            }

            batch.create(
                OutPoint {
                    txid,
                    vout: vout as u32,
                },
                UtxoEntry {
                    value,
                    script_pubkey: output.script_pubkey.clone(),
                    height,
                    is_coinbase,
                },
            );
        }

        if total > MAX_MONEY {
            return Err(BlockValidationErrors::BadOutputValue(total))?;
        }

        Ok(total)
    }
}
