use std::fmt;
use std::io;

use bitcoin::BlockHash;
use bitcoin::OutPoint;

/// Ways a block can fail consensus validation. These are always caused by
/// peer-provided data, never by local state, so the offending block is
/// dropped and the peer that sent it gets disconnected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockValidationErrors {
    BadMerkleRoot,
    BadBip34,
    InvalidProofOfWork,
    BadCompactTarget,
    EmptyBlock,
    FirstTxIsNotCoinbase,
    ExtraCoinbase,
    DuplicateInput(OutPoint),
    BadWitnessCommitment,
    BlockTooBig,
    BadPrevBlock {
        expected: BlockHash,
        got: BlockHash,
    },
    UtxoNotFound(OutPoint),
    ImmatureCoinbaseSpend {
        created: u32,
        spent: u32,
    },
    BadOutputValue(u64),
    OutputsExceedInputs,
    BadCoinbaseOutValue,
    ScriptValidation(String),
}

impl fmt::Display for BlockValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockValidationErrors::BadMerkleRoot => write!(f, "merkle root does not match header"),
            BlockValidationErrors::BadBip34 => {
                write!(f, "coinbase does not encode the block height")
            }
            BlockValidationErrors::InvalidProofOfWork => {
                write!(f, "block hash does not meet the required target")
            }
            BlockValidationErrors::BadCompactTarget => {
                write!(f, "compact target encoding is negative, zero or above the network limit")
            }
            BlockValidationErrors::EmptyBlock => write!(f, "block has no transactions"),
            BlockValidationErrors::FirstTxIsNotCoinbase => {
                write!(f, "first transaction is not a coinbase")
            }
            BlockValidationErrors::ExtraCoinbase => {
                write!(f, "non-first transaction has a null previous output")
            }
            BlockValidationErrors::DuplicateInput(outpoint) => {
                write!(f, "output {outpoint} is spent twice in the same block")
            }
            BlockValidationErrors::BadWitnessCommitment => {
                write!(f, "witness commitment is missing or does not match")
            }
            BlockValidationErrors::BlockTooBig => write!(f, "block exceeds the maximum weight"),
            BlockValidationErrors::BadPrevBlock { expected, got } => {
                write!(f, "block builds on {got}, expected {expected}")
            }
            BlockValidationErrors::UtxoNotFound(outpoint) => {
                write!(f, "input spends unknown output {outpoint}")
            }
            BlockValidationErrors::ImmatureCoinbaseSpend { created, spent } => {
                write!(
                    f,
                    "coinbase output created at height {created} spent at height {spent}"
                )
            }
            BlockValidationErrors::BadOutputValue(value) => {
                write!(f, "output value {value} is out of range")
            }
            BlockValidationErrors::OutputsExceedInputs => {
                write!(f, "transaction outputs exceed its inputs")
            }
            BlockValidationErrors::BadCoinbaseOutValue => {
                write!(f, "coinbase claims more than subsidy plus fees")
            }
            BlockValidationErrors::ScriptValidation(reason) => {
                write!(f, "script validation failed: {reason}")
            }
        }
    }
}

/// The error type returned by everything that touches chain state.
#[derive(Debug)]
pub enum BlockchainError {
    BlockValidation(BlockValidationErrors),
    BlockNotFound(u32),
    CorruptBlockFile { height: u32, length: u64 },
    Database(String),
    Io(io::Error),
}

impl fmt::Display for BlockchainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::BlockValidation(e) => write!(f, "invalid block: {e}"),
            BlockchainError::BlockNotFound(height) => {
                write!(f, "no block stored at height {height}")
            }
            BlockchainError::CorruptBlockFile { height, length } => {
                write!(f, "block file at height {height} has impossible length {length}")
            }
            BlockchainError::Database(e) => write!(f, "database error: {e}"),
            BlockchainError::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for BlockchainError {}

impl From<BlockValidationErrors> for BlockchainError {
    fn from(err: BlockValidationErrors) -> Self {
        BlockchainError::BlockValidation(err)
    }
}

impl From<io::Error> for BlockchainError {
    fn from(err: io::Error) -> Self {
        BlockchainError::Io(err)
    }
}

impl From<redb::Error> for BlockchainError {
    fn from(err: redb::Error) -> Self {
        BlockchainError::Database(err.to_string())
    }
}
