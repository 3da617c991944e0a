use bitcoin::consensus::Params;
use bitcoin::Network;

/// The parameters of the chain we are validating, mostly hardcoded constants
/// that differ between mainnet and the test networks.
#[derive(Debug, Clone)]
pub struct ChainParams {
    /// The network's consensus parameters, as defined by rust-bitcoin. We use
    /// this for the BIP-34 activation height and the proof-of-work limit.
    pub params: Params,
    /// The network we are validating blocks for.
    pub network: Network,
    /// How many blocks between two halvings of the block subsidy.
    pub subsidy_halving_interval: u32,
    /// How many blocks a coinbase output must wait before it can be spent.
    pub coinbase_maturity: u32,
    /// The maximum weight of a block, in weight units.
    pub max_block_weight: u64,
}

impl From<Network> for ChainParams {
    fn from(network: Network) -> Self {
        let subsidy_halving_interval = match network {
            // Regtest halves quickly so tests can exercise the schedule
            Network::Regtest => 150,
            _ => 210_000,
        };

        ChainParams {
            params: Params::new(network),
            network,
            subsidy_halving_interval,
            coinbase_maturity: 100,
            max_block_weight: 4_000_000,
        }
    }
}
