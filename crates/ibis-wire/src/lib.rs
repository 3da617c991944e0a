//! The initial-block-download engine for ibis.
//!
//! Peers speak to the node as typed message values; the transport and wire
//! codec live outside this crate. What lives here is the hard part: the
//! pull-based download scheduler, the sync state machine, and the event loop
//! plus validator worker that tie them to the chain crate.

pub mod download_manager;
pub mod error;
pub mod node;
pub mod peer;
pub mod sync;

pub use download_manager::DownloadConfig;
pub use download_manager::DownloadManager;
pub use download_manager::DownloadSink;
pub use error::WireError;
pub use node::Node;
pub use node::NodeConfig;
pub use node::NodeEvent;
pub use node::NodeHandle;
pub use peer::InventoryEntry;
pub use peer::PeerId;
pub use peer::PeerMessage;
pub use peer::PeerRequest;
pub use sync::SyncConfig;
pub use sync::SyncManager;
pub use sync::SyncMode;
pub use sync::SyncStats;
pub use sync::WorkerOutcome;
