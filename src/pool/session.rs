//! Implements [`Manager`] for broker [`Session`]s.
use super::connection::ConnectionObjectPool;
use super::error::into_broker_error;
use crate::broker::{AckMode, BrokerError, Connection, Session};
use deadpool::managed::{self, Manager, Object};
use std::ops::Deref;
use std::sync::Arc;
use tracing::warn;

pub(crate) type SessionObjectPool = deadpool::managed::Pool<SessionManager>;

/// A session together with the connection it was opened on.
pub(crate) struct SessionHandle {
    connection: Arc<dyn Connection>,
    session: Box<dyn Session>,
}

/// `SessionManager` opens sessions of a single [`AckMode`].
///
/// It borrows connections from the connection pool only for the time it takes to open a
/// session: many sessions share the same connection.
pub(crate) struct SessionManager {
    connections: ConnectionObjectPool,
    ack_mode: AckMode,
}

impl SessionManager {
    pub(crate) fn new(connections: ConnectionObjectPool, ack_mode: AckMode) -> Self {
        Self {
            connections,
            ack_mode,
        }
    }
}

pub(crate) async fn open_session(
    connections: &ConnectionObjectPool,
    ack_mode: AckMode,
) -> Result<SessionHandle, BrokerError> {
    let connection = Arc::clone(&*connections.get().await.map_err(into_broker_error)?);
    let session = connection.create_session(ack_mode).await?;
    Ok(SessionHandle {
        connection,
        session,
    })
}

#[async_trait::async_trait]
impl Manager for SessionManager {
    type Type = SessionHandle;
    type Error = BrokerError;

    #[tracing::instrument(name = "open_session", skip(self), fields(ack_mode = %self.ack_mode))]
    async fn create(&self) -> Result<SessionHandle, BrokerError> {
        open_session(&self.connections, self.ack_mode).await
    }

    async fn recycle(&self, obj: &mut SessionHandle) -> managed::RecycleResult<BrokerError> {
        if obj.session.is_open() && obj.connection.is_healthy() {
            Ok(())
        } else {
            warn!(ack_mode = %self.ack_mode, "Dropping a broken pooled session");
            Err(managed::RecycleError::StaticMessage(
                "Session is not in an healthy state",
            ))
        }
    }
}

/// A session borrowed from the [`ConnectionPool`](super::ConnectionPool).
///
/// Dropping it (or calling [`PooledSession::release`]) returns it to the pool.
/// Call [`PooledSession::discard`] instead if the session is in an unknown state: it is closed
/// and the pool will open a fresh one when needed.
pub struct PooledSession {
    object: Object<SessionManager>,
}

impl PooledSession {
    pub(super) fn new(object: Object<SessionManager>) -> Self {
        Self { object }
    }

    pub fn release(self) {
        drop(self);
    }

    pub async fn discard(self) {
        let handle = Object::take(self.object);
        if let Err(e) = handle.session.close().await {
            warn!(error = ?e, "Failed to close a discarded session");
        }
    }
}

impl Deref for PooledSession {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.object.session.as_ref()
    }
}

/// A session owned outright by its user, outside of the bounded pool.
///
/// Consumer workers and reply listeners hold one for as long as they run.
pub struct DedicatedSession {
    handle: SessionHandle,
}

impl DedicatedSession {
    pub(super) fn new(handle: SessionHandle) -> Self {
        Self { handle }
    }

    pub async fn close(self) {
        if let Err(e) = self.handle.session.close().await {
            warn!(error = ?e, "Failed to close a dedicated session");
        }
    }
}

impl Deref for DedicatedSession {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.handle.session.as_ref()
    }
}
