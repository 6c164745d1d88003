//! Facilities to send messages to a destination. Check out [`ProducerPool`] as a starting point.
mod confirmation;
mod producer_pool;

pub use confirmation::SendConfirmation;
pub use producer_pool::{ProducerError, ProducerPool, ProducerPoolBuilder};
