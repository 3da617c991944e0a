//! A collection of functions that implement the consensus rules for the Bitcoin Network.
//! This module contains functions that are used to verify blocks and transactions, and doesn't
//! assume anything about the chainstate, so it can be used in any context.
//! We use this to avoid code reuse among the different implementations of the chainstate.

pub mod block_validation;
pub mod tx_validation;

use bitcoin::block::Header as BlockHeader;
use bitcoin::Block;
use bitcoin::CompactTarget;
use bitcoin::Target;
use bitcoin::Transaction;
pub use ibis_common::COIN_VALUE;
pub use ibis_common::MAX_MONEY;

use crate::chainparams::ChainParams;
use crate::chainstore::UtxoEntry;
use crate::error::BlockValidationErrors;

/// Locktime values below this are block heights, above are unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// BIP-68: sequence numbers with this bit set are not relative lock times.
const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;

/// BIP-68: if set, the relative lock time is in 512-second ticks, not blocks.
const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;

/// BIP-68: the low 16 bits of the sequence hold the relative lock count.
const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;

/// Validates scripts for transaction inputs. The interpreter itself lives in
/// a separate subsystem; blocks below the assume-valid ceiling never reach it.
pub trait ScriptVerifier {
    fn verify_input(
        &self,
        transaction: &Transaction,
        input: usize,
        spent: &UtxoEntry,
    ) -> Result<(), String>;
}

/// Accepts every script. Used when no interpreter is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullScriptVerifier;

impl ScriptVerifier for NullScriptVerifier {
    fn verify_input(&self, _: &Transaction, _: usize, _: &UtxoEntry) -> Result<(), String> {
        Ok(())
    }
}

/// This struct contains all the information and methods needed to validate a block,
/// it is used by the [ChunkValidator](crate::ChunkValidator) and the header chain
/// to validate blocks and transactions.
#[derive(Debug, Clone)]
pub struct Consensus {
    /// The parameters of the chain we are validating, it is usually hardcoded
    /// constants. See [ChainParams] for more information.
    pub parameters: ChainParams,
}

impl Consensus {
    pub fn new(parameters: ChainParams) -> Self {
        Consensus { parameters }
    }

    /// Returns the amount of block subsidy to be paid in a block, given it's height.
    pub fn get_subsidy(&self, height: u32) -> u64 {
        let halvings = height / self.parameters.subsidy_halving_interval;
        // Force block reward to zero when right shift is undefined.
        if halvings >= 64 {
            return 0;
        }
        let mut subsidy = 50 * COIN_VALUE;
        // Subsidy is cut in half every 210,000 blocks which will occur approximately every 4 years.
        subsidy >>= halvings;
        subsidy
    }

    /// Extracts the BIP-34 height commitment from a block's coinbase, if there
    /// is a well-formed one.
    pub fn get_bip34_height(&self, block: &Block) -> Option<u32> {
        let cb = block.coinbase()?;
        let input = cb.input.first()?;
        Self::parse_coinbase_height(input.script_sig.as_bytes())
    }

    /// Parses the height commitment at the start of a coinbase scriptsig.
    ///
    /// Accepted forms are the ones `CScript() << nHeight` can produce: `OP_0`
    /// for zero, `OP_1..OP_16` for 1..16, and a minimal push of one to four
    /// little-endian bytes for everything else. Returns `None` for truncated
    /// or non-minimal encodings.
    pub fn parse_coinbase_height(script_sig: &[u8]) -> Option<u32> {
        let (&first, rest) = script_sig.split_first()?;
        match first {
            // OP_0
            0x00 => Some(0),
            // OP_1..OP_16
            0x51..=0x60 => Some(first as u32 - 0x50),
            // Push of `first` bytes, little-endian
            1..=4 => {
                let len = first as usize;
                if rest.len() < len {
                    return None;
                }
                let push = &rest[..len];
                let last = push[len - 1];
                // A sign bit on the last byte would make the height negative
                if last & 0x80 != 0 {
                    return None;
                }
                // A trailing zero is only there to clear a would-be sign bit
                if len > 1 && last == 0 && push[len - 2] & 0x80 == 0 {
                    return None;
                }
                let mut height = 0u32;
                for (i, &byte) in push.iter().enumerate() {
                    height |= (byte as u32) << (8 * i);
                }
                // Values up to 16 must use the opcode forms
                if len == 1 && height <= 16 {
                    return None;
                }
                Some(height)
            }
            _ => None,
        }
    }

    /// Checks that the block header hashes below the target its `bits` field
    /// commits to, and that the commitment itself is sane.
    pub fn check_proof_of_work(&self, header: &BlockHeader) -> Result<(), BlockValidationErrors> {
        let target = self.decode_target(header.bits)?;
        if !target.is_met_by(header.block_hash()) {
            return Err(BlockValidationErrors::InvalidProofOfWork);
        }
        Ok(())
    }

    /// Decodes a compact-encoded target, rejecting negative, zero, overflowing
    /// and above-limit encodings.
    pub fn decode_target(&self, bits: CompactTarget) -> Result<Target, BlockValidationErrors> {
        let compact = bits.to_consensus();
        let mantissa = compact & 0x007f_ffff;
        let exponent = compact >> 24;

        // The mantissa is a signed magnitude; a negative target is nonsense
        if mantissa != 0 && compact & 0x0080_0000 != 0 {
            return Err(BlockValidationErrors::BadCompactTarget);
        }

        // Encodings whose value cannot fit 256 bits
        if mantissa != 0
            && (exponent > 34
                || (mantissa > 0xff && exponent > 33)
                || (mantissa > 0xffff && exponent > 32))
        {
            return Err(BlockValidationErrors::BadCompactTarget);
        }

        let target = Target::from_compact(bits);
        if target == Target::ZERO || target > self.parameters.params.max_attainable_target {
            return Err(BlockValidationErrors::BadCompactTarget);
        }

        Ok(target)
    }

    /// A coinbase output may only be spent once it's a hundred blocks deep.
    /// Spending it in the block that created it is never allowed.
    pub fn is_coinbase_mature(&self, created: u32, spend_height: u32) -> bool {
        spend_height >= created + self.parameters.coinbase_maturity
    }

    /// Whether a transaction is final at the given height and median time past.
    ///
    /// A locktime of zero, or every input opting out with a final sequence,
    /// makes the transaction final unconditionally.
    pub fn is_final_tx(transaction: &Transaction, height: u32, median_time_past: u32) -> bool {
        let lock_time = transaction.lock_time.to_consensus_u32();
        if lock_time == 0 {
            return true;
        }
        if transaction
            .input
            .iter()
            .all(|input| input.sequence.to_consensus_u32() == u32::MAX)
        {
            return true;
        }
        if lock_time < LOCKTIME_THRESHOLD {
            lock_time <= height
        } else {
            lock_time <= median_time_past
        }
    }

    /// BIP-68: whether one input's relative lock time has passed, given where
    /// the spent output was confirmed and where the chain is now.
    pub fn sequence_lock_satisfied(
        transaction: &Transaction,
        sequence: u32,
        utxo_height: u32,
        utxo_median_time_past: u32,
        tip_height: u32,
        tip_median_time_past: u32,
    ) -> bool {
        // Only v2 transactions commit to relative lock times
        if transaction.version.0 < 2 {
            return true;
        }
        if sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            return true;
        }
        let count = sequence & SEQUENCE_LOCKTIME_MASK;
        if sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
            utxo_median_time_past + count * 512 <= tip_median_time_past
        } else {
            utxo_height + count <= tip_height
        }
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::absolute;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction;
    use bitcoin::BlockHash;
    use bitcoin::CompactTarget;
    use bitcoin::Network;
    use bitcoin::OutPoint;
    use bitcoin::ScriptBuf;
    use bitcoin::Sequence;
    use bitcoin::Transaction;
    use bitcoin::TxIn;
    use bitcoin::TxMerkleNode;
    use bitcoin::Witness;

    use super::*;

    fn consensus() -> Consensus {
        Consensus::new(ChainParams::from(Network::Bitcoin))
    }

    fn tx_with_sequences(version: i32, lock_time: u32, sequences: &[u32]) -> Transaction {
        Transaction {
            version: transaction::Version(version),
            lock_time: absolute::LockTime::from_consensus(lock_time),
            input: sequences
                .iter()
                .map(|&sequence| TxIn {
                    previous_output: OutPoint::null(),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::from_consensus(sequence),
                    witness: Witness::new(),
                })
                .collect(),
            output: Vec::new(),
        }
    }

    #[test]
    fn subsidy_boundaries() {
        let consensus = consensus();
        assert_eq!(consensus.get_subsidy(0), 5_000_000_000);
        assert_eq!(consensus.get_subsidy(209_999), 5_000_000_000);
        assert_eq!(consensus.get_subsidy(210_000), 2_500_000_000);
        assert_eq!(consensus.get_subsidy(420_000), 1_250_000_000);
        assert_eq!(consensus.get_subsidy(630_000), 625_000_000);
        assert_eq!(consensus.get_subsidy(840_000), 312_500_000);
        assert_eq!(consensus.get_subsidy(6_720_000), 0);
    }

    #[test]
    fn subsidy_halves_every_era() {
        let consensus = consensus();
        for era in 0..70u32 {
            let height = era * 210_000;
            let this = consensus.get_subsidy(height);
            let next = consensus.get_subsidy(height + 210_000);
            if this != 0 || next != 0 {
                assert_eq!(this, next * 2, "era {era}");
            }
        }
    }

    #[test]
    fn total_issuance() {
        let consensus = consensus();
        let mut total = 0u64;
        let mut era = 0u32;
        loop {
            let subsidy = consensus.get_subsidy(era * 210_000);
            if subsidy == 0 {
                break;
            }
            total += 210_000 * subsidy;
            era += 1;
        }
        // 20,999,999.9769 coins, never quite 21 million
        assert_eq!(total, 2_099_999_997_690_000);
    }

    #[test]
    fn coinbase_maturity() {
        let consensus = consensus();
        assert!(!consensus.is_coinbase_mature(100, 100));
        assert!(!consensus.is_coinbase_mature(100, 199));
        assert!(consensus.is_coinbase_mature(100, 200));
        assert!(consensus.is_coinbase_mature(0, 100));
        assert!(!consensus.is_coinbase_mature(0, 99));
    }

    #[test]
    fn bip34_height_vectors() {
        // The mainnet activation block commits to its own height, 227,931
        assert_eq!(
            Consensus::parse_coinbase_height(&[0x03, 0x5b, 0x7a, 0x03]),
            Some(227_931)
        );
        assert_eq!(Consensus::parse_coinbase_height(&[0x00]), Some(0));
        assert_eq!(Consensus::parse_coinbase_height(&[0x51]), Some(1));
        assert_eq!(Consensus::parse_coinbase_height(&[0x60]), Some(16));
        // Two-byte push needing a sign-clearing zero
        assert_eq!(
            Consensus::parse_coinbase_height(&[0x02, 0x80, 0x00]),
            Some(128)
        );

        // Truncated push
        assert_eq!(Consensus::parse_coinbase_height(&[0x03, 0xa0, 0x86]), None);
        // Empty scriptsig
        assert_eq!(Consensus::parse_coinbase_height(&[]), None);
        // Non-minimal: 7 must be OP_7
        assert_eq!(Consensus::parse_coinbase_height(&[0x01, 0x07]), None);
        // Non-minimal: pointless trailing zero
        assert_eq!(Consensus::parse_coinbase_height(&[0x02, 0x20, 0x00]), None);
        // Negative height
        assert_eq!(Consensus::parse_coinbase_height(&[0x01, 0x80]), None);
    }

    #[test]
    fn compact_target_rejects() {
        let consensus = consensus();

        // The genesis target is fine
        assert!(consensus
            .decode_target(CompactTarget::from_consensus(0x1d00_ffff))
            .is_ok());

        // Sign bit set on a nonzero mantissa
        assert_eq!(
            consensus.decode_target(CompactTarget::from_consensus(0x1d80_0000)),
            Err(BlockValidationErrors::BadCompactTarget)
        );
        // Exponent pushes the value past 256 bits
        assert_eq!(
            consensus.decode_target(CompactTarget::from_consensus(0x2300_0001)),
            Err(BlockValidationErrors::BadCompactTarget)
        );
        assert_eq!(
            consensus.decode_target(CompactTarget::from_consensus(0x2201_0000)),
            Err(BlockValidationErrors::BadCompactTarget)
        );
        // Zero target can never be met
        assert_eq!(
            consensus.decode_target(CompactTarget::from_consensus(0)),
            Err(BlockValidationErrors::BadCompactTarget)
        );
        // Valid encoding, but easier than mainnet allows
        assert_eq!(
            consensus.decode_target(CompactTarget::from_consensus(0x207f_ffff)),
            Err(BlockValidationErrors::BadCompactTarget)
        );
    }

    #[test]
    fn proof_of_work_on_regtest() {
        let consensus = Consensus::new(ChainParams::from(Network::Regtest));
        let mut header = BlockHeader {
            version: bitcoin::block::Version::TWO,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_600_000_000,
            bits: CompactTarget::from_consensus(0x207f_ffff),
            nonce: 0,
        };

        // About half of all nonces meet the regtest limit, so both outcomes
        // show up within a few iterations
        while consensus.check_proof_of_work(&header).is_ok() {
            header.nonce += 1;
        }
        assert_eq!(
            consensus.check_proof_of_work(&header),
            Err(BlockValidationErrors::InvalidProofOfWork)
        );
        while consensus.check_proof_of_work(&header).is_err() {
            header.nonce += 1;
        }
        assert!(consensus.check_proof_of_work(&header).is_ok());
    }

    #[test]
    fn absolute_locktime() {
        // Locktime zero is always final
        let tx = tx_with_sequences(1, 0, &[0]);
        assert!(Consensus::is_final_tx(&tx, 0, 0));

        // All inputs final: locktime ignored
        let tx = tx_with_sequences(1, 1_000_000, &[u32::MAX, u32::MAX]);
        assert!(Consensus::is_final_tx(&tx, 10, 0));

        // Height locktime
        let tx = tx_with_sequences(1, 1_000, &[0]);
        assert!(!Consensus::is_final_tx(&tx, 999, 0));
        assert!(Consensus::is_final_tx(&tx, 1_000, 0));

        // Timestamp locktime
        let tx = tx_with_sequences(1, 1_600_000_000, &[0]);
        assert!(!Consensus::is_final_tx(&tx, u32::MAX, 1_599_999_999));
        assert!(Consensus::is_final_tx(&tx, 0, 1_600_000_000));
    }

    #[test]
    fn relative_locktime() {
        let v1 = tx_with_sequences(1, 0, &[10]);
        let v2 = tx_with_sequences(2, 0, &[10]);

        // v1 transactions never carry relative locks
        assert!(Consensus::sequence_lock_satisfied(&v1, 10, 100, 0, 100, 0));

        // Blocks mode: utxo at 100, count 10, spendable from 110
        assert!(!Consensus::sequence_lock_satisfied(&v2, 10, 100, 0, 109, 0));
        assert!(Consensus::sequence_lock_satisfied(&v2, 10, 100, 0, 110, 0));

        // Disable bit turns the lock off
        let sequence = SEQUENCE_LOCKTIME_DISABLE_FLAG | 10;
        assert!(Consensus::sequence_lock_satisfied(&v2, sequence, 100, 0, 0, 0));

        // Time mode: count in 512-second ticks
        let sequence = SEQUENCE_LOCKTIME_TYPE_FLAG | 2;
        assert!(!Consensus::sequence_lock_satisfied(
            &v2, sequence, 0, 1_000, 0, 2_023
        ));
        assert!(Consensus::sequence_lock_satisfied(
            &v2, sequence, 0, 1_000, 0, 2_024
        ));
    }
}
