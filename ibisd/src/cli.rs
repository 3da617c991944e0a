use bitcoin::Network;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    author = "Ibis Developers",
    version,
    about = "ibisd: a pruned Bitcoin full node",
    long_about = "ibisd downloads, validates and stores the Bitcoin block \
                  chain, keeping the UTXO set in a local database and \
                  optionally pruning old block files."
)]
pub struct Cli {
    /// The network to operate on: bitcoin, testnet, testnet4, signet or regtest
    #[arg(short, long, default_value = "bitcoin")]
    pub network: Network,

    /// Where to store chain data; defaults to ~/.ibis
    #[arg(long)]
    pub data_dir: Option<String>,

    /// A TOML config file; defaults to {data_dir}/config.toml
    #[arg(short, long)]
    pub config_file: Option<String>,

    /// Target size of resident block files, in megabytes. Values below 128
    /// are raised to 128; zero keeps every block file (archival)
    #[arg(long, default_value_t = 0)]
    pub prune: u64,

    /// Skip script validation at or below this height
    #[arg(long)]
    pub assume_valid: Option<u32>,

    /// Blocks validated and flushed per chunk
    #[arg(long)]
    pub chunk_size: Option<u32>,

    /// Also write logs to {data_dir}/output.log
    #[arg(long, default_value_t = false)]
    pub log_to_file: bool,

    /// Print debug logs
    #[arg(short, long, default_value_t = false)]
    pub debug: bool,
}
