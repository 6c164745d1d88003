use crate::broker::BrokerError;
use std::time::Duration;

/// Pool error.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("No session became available within {0:?}")]
    Exhausted(Duration),
    #[error("Failed to create a broker connection or session")]
    ResourceCreation(#[source] BrokerError),
    #[error("The connection pool has been shut down")]
    Closed,
    #[error("Invalid pool configuration: {0}")]
    InvalidConfiguration(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl From<deadpool::managed::PoolError<BrokerError>> for PoolError {
    fn from(err: deadpool::managed::PoolError<BrokerError>) -> Self {
        match err {
            deadpool::managed::PoolError::Backend(e) => Self::ResourceCreation(e),
            deadpool::managed::PoolError::Closed => Self::Closed,
            err => Self::Unexpected(err.into()),
        }
    }
}

/// Collapse a failure to check out a pooled connection into the error of the operation that
/// needed it.
pub(super) fn into_broker_error(err: deadpool::managed::PoolError<BrokerError>) -> BrokerError {
    match err {
        deadpool::managed::PoolError::Backend(e) => e,
        deadpool::managed::PoolError::Closed => BrokerError::Closed("connection pool"),
        err => BrokerError::Transport(err.into()),
    }
}
