//! Correlation-based request/reply on top of a [`ProducerPool`](crate::publishers::ProducerPool).
//!
//! The requesting side uses a [`RequestReplyCoordinator`]; the replying side is an ordinary
//! consumer whose handler answers through a [`Replier`], usually wrapped in a
//! [`ReplyingHandler`].
use crate::message::CorrelationId;
use crate::publishers::ProducerError;
use std::time::Duration;

mod coordinator;
mod pending;
mod replier;

pub use coordinator::{RequestReplyCoordinator, RequestReplyCoordinatorBuilder, ReplyStrategy};
pub use pending::ReplyCallback;
pub use replier::{Replier, ReplyingHandler, Responder};

/// Error returned by [`RequestReplyCoordinator`].
#[derive(thiserror::Error, Debug)]
pub enum RequestError {
    #[error("Failed to send the request")]
    Send(#[source] ProducerError),
    #[error("No reply received within {0:?}")]
    ReplyTimeout(Duration),
    #[error("Failed to set up the reply destination")]
    ReplyDestination(#[source] anyhow::Error),
    #[error("The request/reply coordinator has been shut down")]
    Shutdown,
    #[error("A request with correlation id {0} is already waiting for its reply")]
    DuplicateCorrelationId(CorrelationId),
}
