use super::SendConfirmation;
use crate::broker::BrokerError;
use crate::message::{DeliveryMode, Destination, Message};
use crate::pool::{ConnectionPool, PoolError, PooledSession};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// A high-level interface to send messages through a bounded set of pooled sessions.
///
/// Three ways to send:
/// - [`ProducerPool::send_sync`] returns once the broker confirmed the message;
/// - [`ProducerPool::send_async`] returns once the message is handed over, and the confirmation
///   arrives later through a [`SendConfirmation`];
/// - [`ProducerPool::send_transactional`] sends a batch that becomes visible all at once, or
///   not at all.
///
/// Every borrowed session goes back to the pool, whatever the outcome. A session whose state is
/// unknown after a failure is discarded instead, and replaced on demand.
///
/// # How do I build a `ProducerPool`?
///
/// The starting point is [`ProducerPool::builder`].
///
/// ```rust
/// use carrot_courier::broker::memory::MemoryBroker;
/// use carrot_courier::message::Message;
/// use carrot_courier::pool::ConnectionPool;
/// use carrot_courier::publishers::ProducerPool;
///
/// async fn send() -> anyhow::Result<()> {
///     let pool = ConnectionPool::builder(MemoryBroker::new()).build().await?;
///     let producers = ProducerPool::builder(pool)
///         .publish_timeout(std::time::Duration::from_secs(3))
///         .build();
///
///     producers.send_sync("orders", Message::new("order #1")).await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ProducerPool {
    connection_pool: ConnectionPool,
    acquire_timeout: Duration,
    publish_timeout: Duration,
}

impl ProducerPool {
    pub fn builder(connection_pool: ConnectionPool) -> ProducerPoolBuilder {
        ProducerPoolBuilder::new(connection_pool)
    }

    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.connection_pool
    }

    /// Send a message and wait for the broker to confirm it.
    #[tracing::instrument(
        name = "send",
        skip(self, message),
        fields(mode = %DeliveryMode::Sync, message_id)
    )]
    pub async fn send_sync(&self, destination: &str, message: Message) -> Result<(), ProducerError> {
        let destination = Destination::from(destination);
        let message = inject_message_properties(message);
        record_message_id(&message);

        let session = self
            .connection_pool
            .acquire(self.acquire_timeout)
            .await?;
        let outcome = tokio::time::timeout(self.publish_timeout, async {
            session.publish(&destination, message).await?.await
        })
        .await;
        match outcome {
            Ok(Ok(())) => {
                session.release();
                debug!("Message sent");
                Ok(())
            }
            Ok(Err(e)) => {
                give_back(session, &e).await;
                Err(ProducerError::SendRejected(e))
            }
            Err(_) => {
                // The session may still deliver the confirmation we stopped waiting for.
                session.discard().await;
                Err(ProducerError::Timeout(self.publish_timeout))
            }
        }
    }

    /// Hand a message over to the broker and return without waiting for its confirmation.
    ///
    /// The session goes back to the pool straight away; the confirmation is awaited on a
    /// background task and surfaces through the returned [`SendConfirmation`].
    #[tracing::instrument(
        name = "send",
        skip(self, message),
        fields(mode = %DeliveryMode::Async, message_id)
    )]
    pub async fn send_async(
        &self,
        destination: &str,
        message: Message,
    ) -> Result<SendConfirmation, ProducerError> {
        let destination = Destination::from(destination);
        let message = inject_message_properties(message);
        record_message_id(&message);

        let session = self
            .connection_pool
            .acquire(self.acquire_timeout)
            .await?;
        let pending = match session.publish(&destination, message).await {
            Ok(pending) => {
                session.release();
                pending
            }
            Err(e) => {
                give_back(session, &e).await;
                return Err(ProducerError::SendRejected(e));
            }
        };

        let (sender, receiver) = oneshot::channel();
        let publish_timeout = self.publish_timeout;
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(publish_timeout, pending).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(ProducerError::SendRejected(e)),
                Err(_) => Err(ProducerError::Timeout(publish_timeout)),
            };
            if let Err(e) = &outcome {
                warn!(error = ?e, destination = %destination, "Asynchronous send failed");
            }
            // Nobody may be listening anymore, which is fine.
            let _ = sender.send(outcome);
        });
        Ok(SendConfirmation::new(receiver))
    }

    /// Send a batch of messages within a single transaction: either all of them become
    /// visible, or none does.
    ///
    /// A failed send or commit rolls the transaction back. If the rollback fails too the
    /// session is discarded and [`ProducerError::RollbackFailed`] is returned.
    #[tracing::instrument(
        name = "send",
        skip(self, messages),
        fields(mode = %DeliveryMode::Transactional, batch_size = messages.len())
    )]
    pub async fn send_transactional(
        &self,
        destination: &str,
        messages: Vec<Message>,
    ) -> Result<(), ProducerError> {
        let destination = Destination::from(destination);
        let session = self
            .connection_pool
            .acquire_transacted(self.acquire_timeout)
            .await?;

        for (index, message) in messages.into_iter().enumerate() {
            let message = inject_message_properties(message);
            if let Err(e) = session.send(&destination, message).await {
                warn!(index, error = ?e, "Transactional send failed, rolling back");
                return Err(abort(session, ProducerError::SendRejected(e)).await);
            }
        }
        if let Err(e) = session.commit().await {
            warn!(error = ?e, "Commit failed, rolling back");
            return Err(abort(session, ProducerError::CommitFailed(e)).await);
        }
        session.release();
        debug!("Transaction committed");
        Ok(())
    }
}

/// Roll back the ongoing transaction after `cause`, then dispose of the session.
async fn abort(session: PooledSession, cause: ProducerError) -> ProducerError {
    match session.rollback().await {
        Ok(()) => {
            if cause.leaves_session_usable() {
                session.release();
            } else {
                session.discard().await;
            }
            cause
        }
        Err(rollback_error) => {
            warn!(error = ?rollback_error, "Rollback failed, discarding the session");
            session.discard().await;
            ProducerError::RollbackFailed {
                source: rollback_error,
                cause: Box::new(cause),
            }
        }
    }
}

async fn give_back(session: PooledSession, error: &BrokerError) {
    if error.is_rejection() {
        session.release();
    } else {
        session.discard().await;
    }
}

fn record_message_id(message: &Message) {
    if let Some(message_id) = &message.message_id {
        tracing::Span::current().record("message_id", message_id.as_str());
    }
}

/// Stamp the message with a unique id and the current time, unless they are already set.
pub(crate) fn inject_message_properties(mut message: Message) -> Message {
    if message.timestamp.is_none() {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(now) => message.timestamp = Some(now.as_secs()),
            Err(_) => warn!("System time is before 1970"),
        }
    }
    if message.message_id.is_none() {
        message.message_id = Some(Uuid::new_v4().to_string());
    }
    message
}

/// Error returned when trying to send a message using [`ProducerPool`].
#[derive(thiserror::Error, Debug)]
pub enum ProducerError {
    /// No session could be borrowed: the pool is exhausted, shut down, or cannot reach the broker.
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("The broker refused the message")]
    SendRejected(#[source] BrokerError),
    #[error("The broker failed to commit the transaction")]
    CommitFailed(#[source] BrokerError),
    #[error("Rolling back the transaction failed after: {cause}")]
    RollbackFailed {
        #[source]
        source: BrokerError,
        cause: Box<ProducerError>,
    },
    #[error("The broker did not confirm the message within {0:?}")]
    Timeout(Duration),
    #[error("The confirmation of an asynchronous send was lost")]
    ConfirmationLost,
}

impl ProducerError {
    fn leaves_session_usable(&self) -> bool {
        match self {
            ProducerError::SendRejected(e) | ProducerError::CommitFailed(e) => e.is_rejection(),
            _ => false,
        }
    }
}

/// A builder for [`ProducerPool`].
///
/// Use [`ProducerPool::builder`] as entrypoint.
pub struct ProducerPoolBuilder {
    connection_pool: ConnectionPool,
    acquire_timeout: Duration,
    publish_timeout: Duration,
}

impl ProducerPoolBuilder {
    fn new(connection_pool: ConnectionPool) -> Self {
        Self {
            acquire_timeout: connection_pool.default_acquire_timeout(),
            connection_pool,
            publish_timeout: Duration::from_secs(3),
        }
    }

    /// How long to wait for a free session before failing with [`PoolError::Exhausted`].
    /// Defaults to the connection pool's acquire timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// How long to wait for the broker to confirm a message.
    /// Defaults to 3 seconds if left unspecified.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn build(self) -> ProducerPool {
        ProducerPool {
            connection_pool: self.connection_pool,
            acquire_timeout: self.acquire_timeout,
            publish_timeout: self.publish_timeout,
        }
    }
}
