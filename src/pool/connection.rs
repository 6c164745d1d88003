//! Implements [`Manager`] for broker [`Connection`]s.
use crate::broker::{Broker, BrokerError, Connection};
use deadpool::managed::{self, Manager};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

pub(crate) type ConnectionObjectPool = deadpool::managed::Pool<ConnectionManager>;

/// Opens connections through a [`Broker`] and remembers them, so they can all be closed on
/// shutdown.
pub(crate) struct ConnectionManager {
    broker: Arc<dyn Broker>,
    opened: Mutex<Vec<Arc<dyn Connection>>>,
}

impl ConnectionManager {
    pub(crate) fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Every connection opened so far that is still alive. The manager forgets about them.
    pub(crate) fn drain(&self) -> Vec<Arc<dyn Connection>> {
        std::mem::take(&mut *self.opened.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait::async_trait]
impl Manager for ConnectionManager {
    type Type = Arc<dyn Connection>;
    type Error = BrokerError;

    #[tracing::instrument(name = "open_connection", skip(self))]
    async fn create(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        let connection = self.broker.connect().await?;
        let mut opened = self.opened.lock().unwrap_or_else(PoisonError::into_inner);
        opened.retain(|c| c.is_healthy());
        opened.push(Arc::clone(&connection));
        Ok(connection)
    }

    async fn recycle(&self, obj: &mut Arc<dyn Connection>) -> managed::RecycleResult<BrokerError> {
        if obj.is_healthy() {
            Ok(())
        } else {
            warn!("Dropping a broken broker connection");
            Err(managed::RecycleError::StaticMessage(
                "Connection is not in an healthy state",
            ))
        }
    }
}
