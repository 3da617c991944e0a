//! Typed peer messages. The wire codec lives in the transport layer; by the
//! time anything reaches this crate it is already a well-formed value.

use std::fmt;

use bitcoin::block::Header as BlockHeader;
use bitcoin::Block;
use bitcoin::BlockHash;
use bitcoin::Transaction;
use bitcoin::Txid;

/// Identifies one peer connection for its whole lifetime. Ids are never
/// reused within a node run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer={}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InventoryEntry {
    Block(BlockHash),
    WitnessBlock(BlockHash),
    Tx(Txid),
    WitnessTx(Txid),
}

/// Everything a peer can say to us.
#[derive(Debug, Clone)]
pub enum PeerMessage {
    Version {
        version: u32,
        user_agent: String,
        start_height: u32,
    },
    Verack,
    Headers(Vec<BlockHeader>),
    Block(Block),
    Tx(Transaction),
    Inv(Vec<InventoryEntry>),
    GetData(Vec<InventoryEntry>),
    GetHeaders {
        locator: Vec<BlockHash>,
        stop: BlockHash,
    },
    NotFound(Vec<InventoryEntry>),
    Ping(u64),
    Pong(u64),
    Addr(Vec<String>),
    GetAddr,
    // Feature negotiation, recognized and ignored
    SendHeaders,
    SendAddrV2,
    WtxidRelay,
}

/// Everything we can ask the transport to do with a peer.
#[derive(Debug, Clone)]
pub enum PeerRequest {
    GetData(Vec<BlockHash>),
    GetHeaders {
        locator: Vec<BlockHash>,
        stop: BlockHash,
    },
    Ping(u64),
    Pong(u64),
    Disconnect { reason: String },
}
