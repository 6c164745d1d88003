use super::pending::{PendingReplies, Registration, ReplyCallback, Waiter};
use super::RequestError;
use crate::broker::{AckMode, BrokerError, IncomingStream, Selector};
use crate::configuration::RequestReplySettings;
use crate::message::{CorrelationId, DeliveryMode, Destination, Incoming, Message};
use crate::pool::{ConnectionPool, DedicatedSession};
use crate::publishers::ProducerPool;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// Where the replies to a coordinator's requests are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStrategy {
    /// A temporary destination, created for the coordinator and removed with it.
    Temporary,
    /// A named destination, possibly shared by several coordinators: each one only receives
    /// the replies whose correlation id it generated. Requires selector support.
    Shared { destination: String },
}

/// Sends requests and routes their replies back to the caller that sent them.
///
/// Every request is stamped with a fresh correlation id and the coordinator's reply
/// destination. A single listener receives the replies and hands each one over to the request
/// with the same correlation id; replies nobody is waiting for are logged and dropped.
///
/// Cloning a `RequestReplyCoordinator` gives another handle to the same coordinator.
///
/// ```rust
/// use carrot_courier::broker::memory::MemoryBroker;
/// use carrot_courier::message::Message;
/// use carrot_courier::pool::ConnectionPool;
/// use carrot_courier::publishers::ProducerPool;
/// use carrot_courier::request_reply::RequestReplyCoordinator;
/// use std::time::Duration;
///
/// async fn ask() -> anyhow::Result<()> {
///     let pool = ConnectionPool::builder(MemoryBroker::new()).build().await?;
///     let producers = ProducerPool::builder(pool.clone()).build();
///     let coordinator = RequestReplyCoordinator::builder(producers).start().await?;
///
///     let reply = coordinator
///         .request_sync("pricing", Message::new("quote?"), Duration::from_secs(5))
///         .await?;
///     println!("{}", reply.payload_str());
///     coordinator.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct RequestReplyCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    producers: ProducerPool,
    reply_to: Destination,
    correlation_prefix: String,
    default_timeout: Duration,
    pending: PendingReplies,
    shutdown: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl RequestReplyCoordinator {
    pub fn builder(producers: ProducerPool) -> RequestReplyCoordinatorBuilder {
        RequestReplyCoordinatorBuilder::new(producers)
    }

    /// The destination replies are expected on.
    pub fn reply_destination(&self) -> &Destination {
        &self.inner.reply_to
    }

    /// Number of requests still waiting for their reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    fn prepare(&self, message: Message) -> (CorrelationId, Message) {
        let correlation_id = CorrelationId::random_with_prefix(&self.inner.correlation_prefix);
        let request = message
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(self.inner.reply_to.clone());
        (correlation_id, request)
    }

    fn ensure_running(&self) -> Result<(), RequestError> {
        if self.inner.shutdown.is_cancelled() {
            Err(RequestError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Send a request and wait up to `timeout` for its reply.
    ///
    /// `timeout` covers the whole exchange, sending included.
    #[tracing::instrument(
        name = "request",
        skip(self, message, timeout),
        fields(mode = %DeliveryMode::Request, correlation_id)
    )]
    pub async fn request_sync(
        &self,
        destination: &str,
        message: Message,
        timeout: Duration,
    ) -> Result<Incoming, RequestError> {
        self.ensure_running()?;
        let deadline = Instant::now() + timeout;
        let (correlation_id, request) = self.prepare(message);
        tracing::Span::current().record("correlation_id", correlation_id.as_str());

        let (sender, receiver) = oneshot::channel();
        self.inner
            .pending
            .register(correlation_id.clone(), Waiter::Blocking(sender))?;
        let _registration = Registration::new(&self.inner.pending, correlation_id);

        let sent = tokio::time::timeout_at(
            deadline,
            self.inner.producers.send_sync(destination, request),
        )
        .await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(RequestError::Send(e)),
            Err(_) => return Err(RequestError::ReplyTimeout(timeout)),
        }

        match tokio::time::timeout_at(deadline, receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RequestError::Shutdown),
            Err(_) => {
                tracing::debug!("No reply before the deadline");
                Err(RequestError::ReplyTimeout(timeout))
            }
        }
    }

    /// Same as [`RequestReplyCoordinator::request_sync`], with the coordinator's default timeout.
    pub async fn request(
        &self,
        destination: &str,
        message: Message,
    ) -> Result<Incoming, RequestError> {
        self.request_sync(destination, message, self.inner.default_timeout)
            .await
    }

    /// Send a request and return as soon as it is handed over to the broker.
    ///
    /// Once this returns `Ok`, `on_reply` is invoked exactly once, on a background task: with the
    /// reply, with [`RequestError::ReplyTimeout`] if none arrived within `timeout`, or with the
    /// reason the request could not be delivered.
    ///
    /// If this returns an error (the coordinator is shut down, the correlation id is already in
    /// use, or the send is refused straight away) `on_reply` is dropped without being invoked.
    #[tracing::instrument(
        name = "request",
        skip(self, message, timeout, on_reply),
        fields(mode = %DeliveryMode::Async, correlation_id)
    )]
    pub async fn request_async<F>(
        &self,
        destination: &str,
        message: Message,
        timeout: Duration,
        on_reply: F,
    ) -> Result<CorrelationId, RequestError>
    where
        F: FnOnce(Result<Incoming, RequestError>) + Send + 'static,
    {
        self.ensure_running()?;
        let deadline = Instant::now() + timeout;
        let (correlation_id, request) = self.prepare(message);
        tracing::Span::current().record("correlation_id", correlation_id.as_str());

        let resolved = CancellationToken::new();
        let callback: ReplyCallback = Box::new(on_reply);
        self.inner.pending.register(
            correlation_id.clone(),
            Waiter::Callback {
                callback,
                resolved: resolved.clone(),
            },
        )?;

        let confirmation = match self.inner.producers.send_async(destination, request).await {
            Ok(confirmation) => confirmation,
            Err(e) => {
                // Nobody else can see the entry yet: report through the return value only.
                self.inner.pending.remove(&correlation_id);
                return Err(RequestError::Send(e));
            }
        };

        let inner = Arc::clone(&self.inner);
        let expiring = correlation_id.clone();
        tokio::spawn(
            async move {
                let failure = tokio::select! {
                    _ = resolved.cancelled() => return,
                    confirmed = confirmation => match confirmed {
                        Ok(()) => tokio::select! {
                            _ = resolved.cancelled() => return,
                            _ = tokio::time::sleep_until(deadline) => RequestError::ReplyTimeout(timeout),
                        },
                        Err(e) => RequestError::Send(e),
                    },
                };
                if let Some(waiter) = inner.pending.remove(&expiring) {
                    tracing::debug!(error = %failure, "Request expired");
                    waiter.fail(failure);
                }
            }
            .in_current_span(),
        );
        Ok(correlation_id)
    }

    /// Stop listening for replies and fail every pending request with
    /// [`RequestError::Shutdown`]. Calling `shutdown` more than once is harmless.
    #[tracing::instrument(skip(self), name = "request_reply_shutdown")]
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let listener = self.inner.listener.lock().await.take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                tracing::error!(error = ?e, "Reply listener crashed");
            }
        }
    }
}

/// Stops the coordinator and fails whatever is still pending, however the listener exits.
struct ListenerGuard<'a> {
    inner: &'a CoordinatorInner,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        // Requests sent from now on would never see their reply.
        self.inner.shutdown.cancel();
        for waiter in self.inner.pending.drain() {
            waiter.fail(RequestError::Shutdown);
        }
    }
}

/// Receive replies until told to stop, then fail whatever is still pending.
async fn listen(
    inner: Arc<CoordinatorInner>,
    session: DedicatedSession,
    strategy: ReplyStrategy,
    mut replies: IncomingStream,
) {
    let guard = ListenerGuard { inner: &inner };
    loop {
        tokio::select! {
            biased;

            _ = inner.shutdown.cancelled() => break,
            reply = replies.next() => match reply {
                Some(Ok(reply)) => {
                    inner.pending.dispatch(reply);
                }
                Some(Err(e)) => {
                    tracing::error!(error = ?e, "Reply listener lost its session");
                    break;
                }
                None => break,
            },
        }
    }
    drop(replies);
    drop(guard);

    if strategy == ReplyStrategy::Temporary && session.is_open() {
        if let Err(e) = session.delete_destination(&inner.reply_to).await {
            tracing::warn!(error = ?e, "Failed to delete the temporary reply destination");
        }
    }
    session.close().await;
    tracing::info!("Reply listener stopped");
}

/// A builder for [`RequestReplyCoordinator`].
///
/// Use [`RequestReplyCoordinator::builder`] as entrypoint.
pub struct RequestReplyCoordinatorBuilder {
    producers: ProducerPool,
    strategy: ReplyStrategy,
    default_timeout: Duration,
}

impl RequestReplyCoordinatorBuilder {
    fn new(producers: ProducerPool) -> Self {
        let defaults = RequestReplySettings::default();
        Self {
            producers,
            strategy: ReplyStrategy::Temporary,
            default_timeout: defaults.request_timeout(),
        }
    }

    /// Apply every setting from a [`RequestReplySettings`].
    #[must_use]
    pub fn settings(mut self, settings: &RequestReplySettings) -> Self {
        self.default_timeout = settings.request_timeout();
        self.strategy = match &settings.shared_reply_destination {
            Some(destination) => ReplyStrategy::Shared {
                destination: destination.clone(),
            },
            None => ReplyStrategy::Temporary,
        };
        self
    }

    /// Defaults to [`ReplyStrategy::Temporary`].
    #[must_use]
    pub fn reply_strategy(mut self, strategy: ReplyStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// The timeout used by [`RequestReplyCoordinator::request`]. Defaults to 30 seconds.
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set up the reply destination and start listening for replies.
    #[tracing::instrument(skip(self), name = "request_reply_start")]
    pub async fn start(self) -> Result<RequestReplyCoordinator, RequestError> {
        let connection_pool: &ConnectionPool = self.producers.connection_pool();
        let shutdown = connection_pool.shutdown_token().child_token();
        let session = connection_pool
            .open_dedicated(AckMode::Auto)
            .await
            .map_err(|e| RequestError::ReplyDestination(e.into()))?;

        let correlation_prefix = format!("{}.", Uuid::new_v4());
        let setup = async {
            let (reply_to, selector) = match &self.strategy {
                ReplyStrategy::Temporary => (session.create_temporary_destination().await?, None),
                ReplyStrategy::Shared { destination } => {
                    let destination = Destination::from(destination.as_str());
                    session.declare_destination(&destination).await?;
                    let selector = Selector::CorrelationIdPrefix(correlation_prefix.clone());
                    (destination, Some(selector))
                }
            };
            let consumer = session.create_consumer(&reply_to, selector).await?;
            Ok::<_, BrokerError>((reply_to, consumer))
        };
        let (reply_to, consumer) = match setup.await {
            Ok(ready) => ready,
            Err(e) => {
                session.close().await;
                return Err(RequestError::ReplyDestination(e.into()));
            }
        };

        let inner = Arc::new(CoordinatorInner {
            producers: self.producers,
            reply_to,
            correlation_prefix,
            default_timeout: self.default_timeout,
            pending: PendingReplies::default(),
            shutdown,
            listener: Mutex::new(None),
        });
        let listener = tokio::spawn(
            listen(
                Arc::clone(&inner),
                session,
                self.strategy,
                consumer.into_stream(),
            )
            .instrument(tracing::info_span!("reply_listener", reply_to = %inner.reply_to)),
        );
        *inner.listener.lock().await = Some(listener);
        tracing::info!(reply_to = %inner.reply_to, "Request/reply coordinator started");
        Ok(RequestReplyCoordinator { inner })
    }
}
