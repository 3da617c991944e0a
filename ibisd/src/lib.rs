//! The ibis daemon: configuration, logging and lifecycle around the node in
//! `ibis-wire`. The daemon runs the sync engine and exposes a [NodeHandle]
//! for a transport layer to feed peers into.
//!
//! [NodeHandle]: ibis_wire::NodeHandle

mod cli;
mod config_file;
mod error;
mod ibisd;

pub use cli::Cli;
pub use ibisd::Config;
pub use ibisd::Ibisd;
