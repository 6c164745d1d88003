//! Provides pooling for broker connections and sessions using [`deadpool`].
//!
//! [`ConnectionPool`] gives two key guarantees:
//! - at most `max_size` pooled sessions exist per acknowledgement mode, and callers wait (up to
//!   a timeout) for one to be released rather than opening more;
//! - broken sessions and connections are disposed of and recreated on demand.
//!
//! Connections are shared across sessions to limit overhead.
//!
//! ```rust
//! use carrot_courier::broker::memory::MemoryBroker;
//! use carrot_courier::pool::ConnectionPool;
//! use std::time::Duration;
//!
//! async fn example() -> anyhow::Result<()> {
//!     let pool = ConnectionPool::builder(MemoryBroker::new())
//!         .max_size(8)
//!         .max_connections(2)
//!         .build()
//!         .await?;
//!
//!     let session = pool.acquire(Duration::from_secs(1)).await?;
//!     session.release();
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```
use crate::broker::{AckMode, Broker};
use crate::configuration::PoolSettings;
use deadpool::managed::Pool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod connection;
mod error;
mod session;

use connection::{ConnectionManager, ConnectionObjectPool};
use session::{open_session, SessionManager, SessionObjectPool};

pub use error::PoolError;
pub use session::{DedicatedSession, PooledSession};

/// A point-in-time view of a session pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    /// Sessions currently open, borrowed or idle.
    pub size: usize,
    /// Idle sessions ready to be borrowed.
    pub available: usize,
}

impl From<deadpool::Status> for PoolStatus {
    fn from(status: deadpool::Status) -> Self {
        Self {
            max_size: status.max_size,
            size: status.size,
            available: usize::try_from(status.available).unwrap_or(0),
        }
    }
}

/// A bounded pool of broker sessions, on top of a smaller pool of shared connections.
///
/// Cloning a `ConnectionPool` gives another handle to the same pool.
///
/// # How do I build a `ConnectionPool`?
///
/// The starting point is [`ConnectionPool::builder`].
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    connections: ConnectionObjectPool,
    sessions: SessionObjectPool,
    transacted_sessions: SessionObjectPool,
    acquire_timeout: Duration,
    shutdown: CancellationToken,
}

impl ConnectionPool {
    pub fn builder<B: Broker>(broker: B) -> ConnectionPoolBuilder {
        ConnectionPoolBuilder::new(Arc::new(broker))
    }

    /// Same as [`ConnectionPool::builder`], for a broker that is already shared.
    pub fn builder_from_arc(broker: Arc<dyn Broker>) -> ConnectionPoolBuilder {
        ConnectionPoolBuilder::new(broker)
    }

    /// Borrow an auto-acknowledging session, waiting up to `timeout` for one to become free.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledSession, PoolError> {
        self.checkout(&self.inner.sessions, timeout).await
    }

    /// Borrow a transacted session, waiting up to `timeout` for one to become free.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn acquire_transacted(&self, timeout: Duration) -> Result<PooledSession, PoolError> {
        self.checkout(&self.inner.transacted_sessions, timeout)
            .await
    }

    /// The timeout used when none is given explicitly.
    pub fn default_acquire_timeout(&self) -> Duration {
        self.inner.acquire_timeout
    }

    async fn checkout(
        &self,
        pool: &SessionObjectPool,
        timeout: Duration,
    ) -> Result<PooledSession, PoolError> {
        if self.is_shut_down() {
            return Err(PoolError::Closed);
        }
        match tokio::time::timeout(timeout, pool.get()).await {
            Ok(Ok(object)) => Ok(PooledSession::new(object)),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(PoolError::Exhausted(timeout)),
        }
    }

    /// Open a session that does not count against the pool bound.
    ///
    /// It is meant for long-lived users, such as consumer workers, which would otherwise
    /// starve producers.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn open_dedicated(&self, ack_mode: AckMode) -> Result<DedicatedSession, PoolError> {
        if self.is_shut_down() {
            return Err(PoolError::Closed);
        }
        open_session(&self.inner.connections, ack_mode)
            .await
            .map(DedicatedSession::new)
            .map_err(PoolError::ResourceCreation)
    }

    /// Open every pooled session of the given kind upfront.
    pub async fn fill(&self, ack_mode: AckMode) -> Result<(), PoolError> {
        let (pool, timeout) = match ack_mode {
            AckMode::Transacted => (&self.inner.transacted_sessions, self.inner.acquire_timeout),
            _ => (&self.inner.sessions, self.inner.acquire_timeout),
        };
        let max_size = pool.status().max_size;
        let mut held = Vec::with_capacity(max_size);
        for _ in 0..max_size {
            held.push(self.checkout(pool, timeout).await?);
        }
        Ok(())
    }

    /// Status of the auto-acknowledging session pool.
    pub fn status(&self) -> PoolStatus {
        self.inner.sessions.status().into()
    }

    /// Status of the transacted session pool.
    pub fn transacted_status(&self) -> PoolStatus {
        self.inner.transacted_sessions.status().into()
    }

    /// Resolves once [`ConnectionPool::shutdown`] has been called.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Close every session and connection.
    ///
    /// Sessions that are borrowed at the time are closed along with their connection; their
    /// users get errors from then on. Calling `shutdown` more than once is harmless.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.is_shut_down() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.sessions.close();
        self.inner.transacted_sessions.close();
        self.inner.connections.close();
        for connection in self.inner.connections.manager().drain() {
            if let Err(e) = connection.close().await {
                warn!(error = ?e, "Failed to close a broker connection");
            }
        }
        info!("Connection pool shut down");
    }
}

/// A builder for [`ConnectionPool`].
///
/// Use [`ConnectionPool::builder`] as entrypoint.
pub struct ConnectionPoolBuilder {
    broker: Arc<dyn Broker>,
    max_size: usize,
    max_connections: usize,
    acquire_timeout: Duration,
    eager_fill: bool,
}

impl ConnectionPoolBuilder {
    fn new(broker: Arc<dyn Broker>) -> Self {
        let defaults = PoolSettings::default();
        Self {
            broker,
            max_size: defaults.producer_pool_size,
            max_connections: defaults.max_connections,
            acquire_timeout: defaults.acquire_timeout(),
            eager_fill: defaults.eager_fill,
        }
    }

    /// Apply every setting from a [`PoolSettings`].
    #[must_use]
    pub fn settings(self, settings: &PoolSettings) -> Self {
        self.max_size(settings.producer_pool_size)
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout())
            .eager_fill(settings.eager_fill)
    }

    /// Maximum number of pooled sessions, per acknowledgement mode.
    #[must_use]
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    #[must_use]
    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// How long to wait for a session when none is given explicitly.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Open every auto-acknowledging pooled session while building.
    #[must_use]
    pub fn eager_fill(mut self, eager_fill: bool) -> Self {
        self.eager_fill = eager_fill;
        self
    }

    pub async fn build(self) -> Result<ConnectionPool, PoolError> {
        if self.max_size == 0 || self.max_connections == 0 {
            return Err(PoolError::InvalidConfiguration(
                "pool sizes must be at least 1".into(),
            ));
        }
        let connections = Pool::builder(ConnectionManager::new(self.broker))
            .max_size(self.max_connections)
            .build()
            .map_err(|e| anyhow::Error::msg(e.to_string()))?;
        let session_pool = |ack_mode| {
            Pool::builder(SessionManager::new(connections.clone(), ack_mode))
                .max_size(self.max_size)
                .build()
                .map_err(|e| anyhow::Error::msg(e.to_string()))
        };
        let sessions = session_pool(AckMode::Auto)?;
        let transacted_sessions = session_pool(AckMode::Transacted)?;

        let pool = ConnectionPool {
            inner: Arc::new(PoolInner {
                connections,
                sessions,
                transacted_sessions,
                acquire_timeout: self.acquire_timeout,
                shutdown: CancellationToken::new(),
            }),
        };
        if self.eager_fill {
            if let Err(e) = pool.fill(AckMode::Auto).await {
                pool.shutdown().await;
                return Err(e);
            }
        }
        info!(
            max_size = self.max_size,
            max_connections = self.max_connections,
            "Connection pool ready"
        );
        Ok(pool)
    }
}
