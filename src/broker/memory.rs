//! An in-process broker.
//!
//! [`MemoryBroker`] simulates point-to-point queues entirely within the process.
//! It follows the semantics the pools rely on:
//!
//! - each message is delivered to exactly one consumer;
//! - messages received on a client-acknowledged or transacted session stay "in flight" until
//!   they are acknowledged (or committed); recovering, rolling back or closing the session puts
//!   them back at the head of their queue with an increased delivery count;
//! - sends on a transacted session become visible on commit, all together;
//! - temporary destinations disappear with the session that created them.
//!
//! It also exposes knobs to inject failures (refused sends, failed commits, refused
//! connections) and counters to check that sessions are not leaked.
//! There is no persistence: everything is lost when the broker is dropped.
use super::{
    AckMode, Broker, BrokerError, Connection, IncomingStream, MessageConsumer, PendingConfirm,
    Selector, Session,
};
use crate::message::{Destination, Incoming, Message};
use futures_util::{future, stream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// How long a push consumer waits on its queue before checking again whether it was closed.
const PUSH_RECEIVE_INTERVAL: Duration = Duration::from_millis(100);

type SendFilter = Arc<dyn Fn(&Destination, &Message) -> bool + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A broker living in the current process. Cloning it gives another handle to the same queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<Destination, Arc<MemoryQueue>>>,
    send_filter: Mutex<Option<SendFilter>>,
    fail_commits: AtomicBool,
    fail_rollbacks: AtomicBool,
    refuse_connections: AtomicBool,
    connection_attempts: AtomicUsize,
    open_connections: AtomicUsize,
    open_sessions: AtomicUsize,
    next_delivery_tag: AtomicU64,
    /// The prefetch count of every consumer created so far, by destination.
    prefetch_counts: Mutex<HashMap<Destination, Vec<u16>>>,
}

impl BrokerState {
    fn queue(&self, destination: &Destination) -> Arc<MemoryQueue> {
        Arc::clone(
            lock(&self.queues)
                .entry(destination.clone())
                .or_insert_with(|| Arc::new(MemoryQueue::new(destination.clone()))),
        )
    }

    fn rejects(&self, destination: &Destination, message: &Message) -> bool {
        lock(&self.send_filter)
            .as_ref()
            .map_or(false, |reject| reject(destination, message))
    }
}

struct MemoryQueue {
    destination: Destination,
    messages: Mutex<VecDeque<Stored>>,
    arrivals: Notify,
}

#[derive(Clone)]
struct Stored {
    message: Message,
    /// How many times the message was delivered and not acknowledged.
    deliveries: u32,
}

impl MemoryQueue {
    fn new(destination: Destination) -> Self {
        Self {
            destination,
            messages: Mutex::new(VecDeque::new()),
            arrivals: Notify::new(),
        }
    }

    fn push_back(&self, stored: Stored) {
        lock(&self.messages).push_back(stored);
        self.arrivals.notify_waiters();
    }

    fn push_front(&self, stored: Stored) {
        lock(&self.messages).push_front(stored);
        self.arrivals.notify_waiters();
    }

    fn pop(&self, selector: Option<&Selector>) -> Option<Stored> {
        let mut messages = lock(&self.messages);
        let position = match selector {
            None => 0,
            Some(selector) => messages
                .iter()
                .position(|stored| selector.matches(&stored.message))?,
        };
        messages.remove(position)
    }

    fn len(&self) -> usize {
        lock(&self.messages).len()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a message straight onto a destination, bypassing sessions.
    pub fn enqueue(&self, destination: &str, message: Message) {
        self.state.queue(&destination.into()).push_back(Stored {
            message,
            deliveries: 0,
        });
    }

    /// Number of messages waiting on a destination, excluding in-flight ones.
    pub fn queue_depth(&self, destination: &str) -> usize {
        lock(&self.state.queues)
            .get(&Destination::from(destination))
            .map_or(0, |queue| queue.len())
    }

    pub fn destination_exists(&self, destination: &str) -> bool {
        lock(&self.state.queues).contains_key(&Destination::from(destination))
    }

    /// Sends for which `reject` returns `true` are refused by the broker.
    pub fn reject_sends_when<F>(&self, reject: F)
    where
        F: Fn(&Destination, &Message) -> bool + Send + Sync + 'static,
    {
        *lock(&self.state.send_filter) = Some(Arc::new(reject));
    }

    pub fn accept_all_sends(&self) {
        *lock(&self.state.send_filter) = None;
    }

    /// Make every commit fail until switched off again.
    pub fn fail_commits(&self, fail: bool) {
        self.state.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Make every rollback fail until switched off again.
    pub fn fail_rollbacks(&self, fail: bool) {
        self.state.fail_rollbacks.store(fail, Ordering::SeqCst);
    }

    /// Make every connection attempt fail until switched off again.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn connection_attempts(&self) -> usize {
        self.state.connection_attempts.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.state.open_connections.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.state.open_sessions.load(Ordering::SeqCst)
    }

    /// The prefetch count each consumer of `destination` was created with, `0` meaning no limit.
    ///
    /// Consumers here only ever hold the message being processed, so the count is recorded
    /// rather than enforced.
    pub fn consumer_prefetch_counts(&self, destination: &str) -> Vec<u16> {
        lock(&self.state.prefetch_counts)
            .get(&Destination::from(destination))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        self.state.connection_attempts.fetch_add(1, Ordering::SeqCst);
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect(anyhow::anyhow!(
                "the in-memory broker is refusing connections"
            )));
        }
        self.state.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            broker: Arc::clone(&self.state),
            open: AtomicBool::new(true),
            sessions: Mutex::new(Vec::new()),
        }))
    }
}

struct MemoryConnection {
    broker: Arc<BrokerState>,
    open: AtomicBool,
    sessions: Mutex<Vec<Weak<SessionState>>>,
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    async fn create_session(&self, ack_mode: AckMode) -> Result<Box<dyn Session>, BrokerError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed("connection"));
        }
        let state = Arc::new(SessionState {
            broker: Arc::clone(&self.broker),
            ack_mode,
            open: AtomicBool::new(true),
            prefetch_count: AtomicU16::new(0),
            closed: Notify::new(),
            inner: Mutex::new(SessionInner::default()),
        });
        self.broker.open_sessions.fetch_add(1, Ordering::SeqCst);
        let mut sessions = lock(&self.sessions);
        sessions.retain(|session| session.strong_count() > 0);
        sessions.push(Arc::downgrade(&state));
        Ok(Box::new(MemorySession { state }))
    }

    fn is_healthy(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.open.swap(false, Ordering::SeqCst) {
            let sessions = std::mem::take(&mut *lock(&self.sessions));
            for session in sessions.iter().filter_map(Weak::upgrade) {
                session.close();
            }
            self.broker.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct SessionState {
    broker: Arc<BrokerState>,
    ack_mode: AckMode,
    open: AtomicBool,
    prefetch_count: AtomicU16,
    closed: Notify,
    inner: Mutex<SessionInner>,
}

#[derive(Default)]
struct SessionInner {
    staged: Vec<(Arc<MemoryQueue>, Message)>,
    in_flight: Vec<InFlight>,
    temporary: Vec<Destination>,
}

struct InFlight {
    delivery_tag: u64,
    queue: Arc<MemoryQueue>,
    stored: Stored,
}

impl InFlight {
    fn redeliver(self) {
        self.queue.push_front(Stored {
            message: self.stored.message,
            deliveries: self.stored.deliveries + 1,
        });
    }
}

impl SessionState {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Closed("session"))
        }
    }

    fn deliver(&self, queue: &Arc<MemoryQueue>, stored: Stored) -> Incoming {
        let delivery_tag = self.broker.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let incoming = Incoming::new(
            queue.destination.clone(),
            stored.message.clone(),
            delivery_tag,
            stored.deliveries + 1,
        );
        if self.ack_mode != AckMode::Auto {
            lock(&self.inner).in_flight.push(InFlight {
                delivery_tag,
                queue: Arc::clone(queue),
                stored,
            });
        }
        incoming
    }

    fn take_in_flight(&self, delivery_tag: u64) -> Option<InFlight> {
        let mut inner = lock(&self.inner);
        let position = inner
            .in_flight
            .iter()
            .position(|in_flight| in_flight.delivery_tag == delivery_tag)?;
        Some(inner.in_flight.remove(position))
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let inner = std::mem::take(&mut *lock(&self.inner));
        // Oldest deliveries must end up at the head of their queue.
        for in_flight in inner.in_flight.into_iter().rev() {
            in_flight.redeliver();
        }
        let mut queues = lock(&self.broker.queues);
        for destination in &inner.temporary {
            queues.remove(destination);
        }
        drop(queues);
        self.broker.open_sessions.fetch_sub(1, Ordering::SeqCst);
        self.closed.notify_waiters();
    }
}

struct MemorySession {
    state: Arc<SessionState>,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.state.close();
    }
}

#[async_trait::async_trait]
impl Session for MemorySession {
    fn ack_mode(&self) -> AckMode {
        self.state.ack_mode
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    async fn publish(
        &self,
        destination: &Destination,
        message: Message,
    ) -> Result<PendingConfirm, BrokerError> {
        self.state.ensure_open()?;
        let rejected = self.state.broker.rejects(destination, &message);
        if self.state.ack_mode.is_transacted() {
            if rejected {
                return Err(BrokerError::Rejected(format!(
                    "`{destination}` refused a transactional send"
                )));
            }
            let queue = self.state.broker.queue(destination);
            lock(&self.state.inner).staged.push((queue, message));
            return Ok(Box::pin(future::ready(Ok(()))));
        }
        if rejected {
            let reason = format!("`{destination}` refused the message");
            return Ok(Box::pin(future::ready(Err(BrokerError::Rejected(reason)))));
        }
        self.state.broker.queue(destination).push_back(Stored {
            message,
            deliveries: 0,
        });
        Ok(Box::pin(future::ready(Ok(()))))
    }

    async fn commit(&self) -> Result<(), BrokerError> {
        self.state.ensure_open()?;
        if !self.state.ack_mode.is_transacted() {
            return Err(BrokerError::Unsupported("commit on a non-transacted session"));
        }
        if self.state.broker.fail_commits.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport(anyhow::anyhow!(
                "the in-memory broker failed the commit"
            )));
        }
        let (staged, consumed) = {
            let mut inner = lock(&self.state.inner);
            (
                std::mem::take(&mut inner.staged),
                std::mem::take(&mut inner.in_flight),
            )
        };
        drop(consumed);
        for (queue, message) in staged {
            queue.push_back(Stored {
                message,
                deliveries: 0,
            });
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), BrokerError> {
        self.state.ensure_open()?;
        if !self.state.ack_mode.is_transacted() {
            return Err(BrokerError::Unsupported(
                "rollback on a non-transacted session",
            ));
        }
        if self.state.broker.fail_rollbacks.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport(anyhow::anyhow!(
                "the in-memory broker failed the rollback"
            )));
        }
        let in_flight = {
            let mut inner = lock(&self.state.inner);
            inner.staged.clear();
            std::mem::take(&mut inner.in_flight)
        };
        for in_flight in in_flight.into_iter().rev() {
            in_flight.redeliver();
        }
        Ok(())
    }

    async fn acknowledge(&self, incoming: &Incoming) -> Result<(), BrokerError> {
        self.state.ensure_open()?;
        // Transacted acknowledgements are settled by `commit`.
        if self.state.ack_mode == AckMode::Client {
            self.state.take_in_flight(incoming.delivery_tag());
        }
        Ok(())
    }

    async fn recover(&self, incoming: &Incoming) -> Result<(), BrokerError> {
        self.state.ensure_open()?;
        if self.state.ack_mode == AckMode::Client {
            if let Some(in_flight) = self.state.take_in_flight(incoming.delivery_tag()) {
                in_flight.redeliver();
            }
        }
        Ok(())
    }

    async fn set_prefetch_count(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.state.ensure_open()?;
        self.state
            .prefetch_count
            .store(prefetch_count, Ordering::SeqCst);
        Ok(())
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<Selector>,
    ) -> Result<Box<dyn MessageConsumer>, BrokerError> {
        self.state.ensure_open()?;
        lock(&self.state.broker.prefetch_counts)
            .entry(destination.clone())
            .or_default()
            .push(self.state.prefetch_count.load(Ordering::SeqCst));
        Ok(Box::new(MemoryConsumer {
            session: Arc::clone(&self.state),
            queue: self.state.broker.queue(destination),
            selector,
        }))
    }

    async fn declare_destination(&self, destination: &Destination) -> Result<(), BrokerError> {
        self.state.ensure_open()?;
        self.state.broker.queue(destination);
        Ok(())
    }

    async fn create_temporary_destination(&self) -> Result<Destination, BrokerError> {
        self.state.ensure_open()?;
        let destination = Destination::new(format!("temp-queue.{}", Uuid::new_v4()));
        self.state.broker.queue(&destination);
        lock(&self.state.inner).temporary.push(destination.clone());
        Ok(destination)
    }

    async fn delete_destination(&self, destination: &Destination) -> Result<(), BrokerError> {
        self.state.ensure_open()?;
        lock(&self.state.broker.queues).remove(destination);
        lock(&self.state.inner)
            .temporary
            .retain(|temporary| temporary != destination);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.close();
        Ok(())
    }
}

struct MemoryConsumer {
    session: Arc<SessionState>,
    queue: Arc<MemoryQueue>,
    selector: Option<Selector>,
}

#[async_trait::async_trait]
impl MessageConsumer for MemoryConsumer {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Incoming>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let arrival = self.queue.arrivals.notified();
            let closed = self.session.closed.notified();
            tokio::pin!(arrival, closed);
            // Register interest before looking at the queue, so a concurrent push wakes us up.
            arrival.as_mut().enable();
            closed.as_mut().enable();

            self.session.ensure_open()?;
            if let Some(stored) = self.queue.pop(self.selector.as_ref()) {
                return Ok(Some(self.session.deliver(&self.queue, stored)));
            }

            tokio::select! {
                _ = &mut arrival => {}
                _ = &mut closed => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    fn into_stream(self: Box<Self>) -> IncomingStream {
        stream::unfold(Some(*self), |consumer| async move {
            let mut consumer = consumer?;
            loop {
                match consumer.receive(PUSH_RECEIVE_INTERVAL).await {
                    Ok(Some(incoming)) => return Some((Ok(incoming), Some(consumer))),
                    Ok(None) => continue,
                    Err(BrokerError::Closed(_)) => return None,
                    Err(e) => return Some((Err(e), None)),
                }
            }
        })
        .boxed()
    }
}
