//! The capabilities every broker transport must provide.
//!
//! The pools in this crate only ever talk to the broker through these traits:
//! - a [`Broker`] opens [`Connection`]s;
//! - a [`Connection`] opens [`Session`]s with a given [`AckMode`];
//! - a [`Session`] sends, commits, rolls back, acknowledges and opens [`MessageConsumer`]s.
//!
//! Two transports ship with the crate: [`crate::amqp::ConnectionFactory`], on top of `lapin`,
//! and [`memory::MemoryBroker`], an in-process broker.
use crate::message::{CorrelationId, Destination, Incoming, Message};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

pub mod memory;

/// Resolves once the broker confirmed (or refused) a published message.
pub type PendingConfirm = BoxFuture<'static, Result<(), BrokerError>>;

/// A stream of messages pushed by the broker to a consumer.
pub type IncomingStream = BoxStream<'static, Result<Incoming, BrokerError>>;

/// How the messages received by a session are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Messages are acknowledged as soon as they are received.
    Auto,
    /// Messages are acknowledged one by one, explicitly.
    Client,
    /// Sends and acknowledgements become effective together on commit.
    Transacted,
}

impl AckMode {
    pub fn is_transacted(&self) -> bool {
        matches!(self, AckMode::Transacted)
    }
}

impl std::fmt::Display for AckMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::Transacted => "transacted",
        };
        f.write_str(s)
    }
}

/// Restricts the messages a consumer receives from its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    CorrelationId(CorrelationId),
    CorrelationIdPrefix(String),
}

impl Selector {
    pub fn matches(&self, message: &Message) -> bool {
        let correlation_id = match &message.correlation_id {
            Some(id) => id,
            None => return false,
        };
        match self {
            Selector::CorrelationId(expected) => correlation_id == expected,
            Selector::CorrelationIdPrefix(prefix) => correlation_id.as_str().starts_with(prefix),
        }
    }
}

/// Errors surfaced by broker transports.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("Failed to connect to the broker")]
    Connect(#[source] anyhow::Error),
    #[error("The broker refused the message: {0}")]
    Rejected(String),
    #[error("The {0} is closed")]
    Closed(&'static str),
    #[error("Not supported by this transport: {0}")]
    Unsupported(&'static str),
    #[error("Generic error encountered when interacting with the broker")]
    Transport(#[source] anyhow::Error),
}

impl BrokerError {
    /// `true` if the broker refused a message while the session itself stayed usable.
    pub fn is_rejection(&self) -> bool {
        matches!(self, BrokerError::Rejected(_))
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        Self::Transport(err.into())
    }
}

/// Entry point of a transport: it knows how to reach the broker.
#[async_trait::async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError>;
}

/// A physical link to the broker, shared by many sessions.
#[async_trait::async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn create_session(&self, ack_mode: AckMode) -> Result<Box<dyn Session>, BrokerError>;

    fn is_healthy(&self) -> bool;

    /// Close the connection and every session opened on it.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A single-threaded unit of work on a connection.
///
/// A session must not be used by two tasks at the same time: the pools hand each session out
/// to exactly one caller.
#[async_trait::async_trait]
pub trait Session: Send + Sync + 'static {
    fn ack_mode(&self) -> AckMode;

    fn is_open(&self) -> bool;

    /// Hand a message over to the broker without waiting for its confirmation.
    ///
    /// On a transacted session the message only becomes visible on [`Session::commit`].
    async fn publish(
        &self,
        destination: &Destination,
        message: Message,
    ) -> Result<PendingConfirm, BrokerError>;

    /// Publish a message and wait for the broker to confirm it.
    async fn send(&self, destination: &Destination, message: Message) -> Result<(), BrokerError> {
        self.publish(destination, message).await?.await
    }

    async fn commit(&self) -> Result<(), BrokerError>;

    /// Discard staged sends and make received messages available for redelivery.
    async fn rollback(&self) -> Result<(), BrokerError>;

    /// Acknowledge a message received on this session.
    ///
    /// On a transacted session the acknowledgement takes effect on commit.
    async fn acknowledge(&self, incoming: &Incoming) -> Result<(), BrokerError>;

    /// Give an unacknowledged message back to the broker for redelivery.
    async fn recover(&self, incoming: &Incoming) -> Result<(), BrokerError>;

    /// Cap how many unacknowledged messages the broker pushes to this session's consumers.
    ///
    /// `0` means no limit. Must be called before the consumers are created.
    async fn set_prefetch_count(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<Selector>,
    ) -> Result<Box<dyn MessageConsumer>, BrokerError>;

    /// Create the destination if it does not exist yet.
    async fn declare_destination(&self, destination: &Destination) -> Result<(), BrokerError>;

    /// A destination that lives as long as this session.
    async fn create_temporary_destination(&self) -> Result<Destination, BrokerError>;

    async fn delete_destination(&self, destination: &Destination) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Receives messages from a single destination.
#[async_trait::async_trait]
pub trait MessageConsumer: Send + 'static {
    /// Wait up to `timeout` for the next message.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Incoming>, BrokerError>;

    /// Switch to push delivery: the broker sends messages as they arrive.
    fn into_stream(self: Box<Self>) -> IncomingStream;
}
