use ibis_chain::BlockchainError;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error(transparent)]
    Chain(#[from] BlockchainError),

    #[error("could not open the chainstate databases: {0}")]
    Database(String),

    #[error("could not spawn the validator worker")]
    WorkerSpawn(#[source] std::io::Error),
}
