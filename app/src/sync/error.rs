use super::validation::ValidationError;
use protocol::Identifier;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Sync of {identifier} stopped at heights {from}..={to} after {attempts} attempts")]
    SyncIncomplete {
        identifier: Identifier,
        from: u64,
        to: u64,
        attempts: usize,
    },
    #[error("Decided message at height {height} failed validation: {source}")]
    ValidationFailed {
        height: u64,
        #[source]
        source: ValidationError,
    },
    #[error("Sync of {0} was cancelled")]
    Cancelled(Identifier),
    #[error("Storage error: {0}")]
    Storage(#[from] crate::store::Error),
    #[error("Network error: {0}")]
    Network(#[from] crate::network::Error),
}
