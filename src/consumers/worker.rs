use crate::broker::{AckMode, BrokerError, MessageConsumer, Session};
use crate::consumers::{Handler, HandlerError};
use crate::message::Incoming;
use crate::pool::DedicatedSession;
use futures_util::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// How workers receive messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeMode {
    /// Each worker repeatedly asks for the next message, blocking up to a timeout.
    Poll,
    /// The broker pushes messages to each worker as they arrive.
    Push,
}

/// Lifecycle of a consumer worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    /// Stop was requested: the in-flight message, if any, is being settled.
    Draining,
    Stopped,
}

/// A point-in-time view of a consumer worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub destination: String,
    pub index: usize,
    pub state: WorkerState,
}

/// What was done with the broker once a delivery had been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Settlement {
    /// Auto-acknowledged on receipt.
    AlreadyAcknowledged,
    Acknowledged,
    Recovered,
    Committed,
    RolledBack,
}

/// Acknowledge, commit, recover or roll back according to the session's acknowledgement mode
/// and the handler's outcome. Fatal errors settle like successes: the message is dropped.
pub(super) async fn settle(
    session: &dyn Session,
    incoming: &Incoming,
    outcome: &Result<(), HandlerError>,
) -> Result<Settlement, BrokerError> {
    let redeliver = matches!(outcome, Err(e) if !e.is_fatal());
    match (session.ack_mode(), redeliver) {
        (AckMode::Auto, _) => Ok(Settlement::AlreadyAcknowledged),
        (AckMode::Client, false) => {
            session.acknowledge(incoming).await?;
            Ok(Settlement::Acknowledged)
        }
        (AckMode::Client, true) => {
            session.recover(incoming).await?;
            Ok(Settlement::Recovered)
        }
        (AckMode::Transacted, false) => {
            session.acknowledge(incoming).await?;
            session.commit().await?;
            Ok(Settlement::Committed)
        }
        (AckMode::Transacted, true) => {
            session.rollback().await?;
            Ok(Settlement::RolledBack)
        }
    }
}

/// The part shared by every kind of worker: the session, the handler and the reported state.
pub(super) struct WorkerContext {
    pub(super) session: DedicatedSession,
    pub(super) handler: Arc<dyn Handler>,
    pub(super) state: watch::Sender<WorkerState>,
}

impl WorkerContext {
    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Run the handler on a message and settle it with the broker.
    ///
    /// Failures, panics included, are logged: they never stop the worker.
    #[tracing::instrument(
        name = "process_message",
        skip_all,
        fields(delivery_count = incoming.delivery_count()),
        level = tracing::Level::DEBUG
    )]
    async fn process(&self, incoming: Incoming) {
        let outcome = AssertUnwindSafe(self.handler.handle(&incoming))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(HandlerError::transient(anyhow::anyhow!(
                    "The message handler panicked"
                )))
            });
        if let Err(e) = &outcome {
            tracing::error!(
                error.kind = %e.error_type,
                error.message = %e.inner_error,
                error.details = ?e.inner_error,
                "Failed to handle message"
            );
        }
        match settle(&*self.session, &incoming, &outcome).await {
            Ok(settlement) => tracing::debug!(?settlement, "Message settled"),
            Err(e) => tracing::error!(error = ?e, "Failed to settle message with the broker"),
        }
    }

    async fn close(self) {
        let WorkerContext { session, state, .. } = self;
        session.close().await;
        state.send_replace(WorkerState::Stopped);
    }
}

/// A consumer worker: it owns a session and processes messages, one at a time, until told to
/// stop.
#[async_trait::async_trait]
pub(super) trait Worker: Send + 'static {
    async fn run(self: Box<Self>, shutdown: CancellationToken);
}

pub(super) struct PollWorker {
    pub(super) context: WorkerContext,
    pub(super) consumer: Box<dyn MessageConsumer>,
    pub(super) receive_timeout: Duration,
}

#[async_trait::async_trait]
impl Worker for PollWorker {
    async fn run(self: Box<Self>, shutdown: CancellationToken) {
        let PollWorker {
            context,
            mut consumer,
            receive_timeout,
        } = *self;
        context.set_state(WorkerState::Running);
        tracing::info!("Worker started");
        loop {
            let received = tokio::select! {
                // Stop before asking for more work.
                biased;

                _ = shutdown.cancelled() => break,
                received = consumer.receive(receive_timeout) => received,
            };
            match received {
                Ok(Some(incoming)) => context.process(incoming).await,
                Ok(None) => continue,
                Err(e) => {
                    if !shutdown.is_cancelled() {
                        tracing::error!(error = ?e, "Worker lost its session");
                    }
                    break;
                }
            }
        }
        context.set_state(WorkerState::Draining);
        drop(consumer);
        context.close().await;
        tracing::info!("Worker stopped");
    }
}

pub(super) struct PushWorker {
    pub(super) context: WorkerContext,
    pub(super) consumer: Box<dyn MessageConsumer>,
}

#[async_trait::async_trait]
impl Worker for PushWorker {
    async fn run(self: Box<Self>, shutdown: CancellationToken) {
        let PushWorker { context, consumer } = *self;
        let mut deliveries = consumer.into_stream();
        context.set_state(WorkerState::Running);
        tracing::info!("Worker started");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                delivery = deliveries.next() => match delivery {
                    Some(Ok(incoming)) => context.process(incoming).await,
                    Some(Err(e)) => {
                        if !shutdown.is_cancelled() {
                            tracing::error!(error = ?e, "Worker lost its session");
                        }
                        break;
                    }
                    None => break,
                },
            }
        }
        context.set_state(WorkerState::Draining);
        drop(deliveries);
        context.close().await;
        tracing::info!("Worker stopped");
    }
}
