use super::RequestError;
use crate::message::{CorrelationId, Incoming};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Invoked at most once with the reply, or with the reason why there will be none.
pub type ReplyCallback = Box<dyn FnOnce(Result<Incoming, RequestError>) + Send + 'static>;

/// Callbacks run on the reply listener: a panicking one must not take it down.
fn run_callback(callback: ReplyCallback, outcome: Result<Incoming, RequestError>) {
    if std::panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
        tracing::error!("A reply callback panicked");
    }
}

pub(super) enum Waiter {
    /// A caller blocked in `request_sync`.
    Blocking(oneshot::Sender<Incoming>),
    /// A callback registered by `request_async`.
    Callback {
        callback: ReplyCallback,
        /// Cancelled once the callback ran, so the timeout task can give up early.
        resolved: CancellationToken,
    },
}

impl Waiter {
    pub(super) fn fail(self, error: RequestError) {
        match self {
            // Dropping the sender wakes the caller up.
            Waiter::Blocking(_) => {}
            Waiter::Callback { callback, resolved } => {
                resolved.cancel();
                run_callback(callback, Err(error));
            }
        }
    }
}

/// Requests awaiting their reply, by correlation id.
///
/// Each entry is removed exactly once: by the matching reply, by a timeout, or on shutdown.
#[derive(Default)]
pub(super) struct PendingReplies {
    waiters: Mutex<HashMap<CorrelationId, Waiter>>,
}

impl PendingReplies {
    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn register(
        &self,
        correlation_id: CorrelationId,
        waiter: Waiter,
    ) -> Result<(), RequestError> {
        let mut waiters = self.lock();
        if waiters.contains_key(&correlation_id) {
            return Err(RequestError::DuplicateCorrelationId(correlation_id));
        }
        waiters.insert(correlation_id, waiter);
        Ok(())
    }

    pub(super) fn remove(&self, correlation_id: &CorrelationId) -> Option<Waiter> {
        self.lock().remove(correlation_id)
    }

    pub(super) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(super) fn drain(&self) -> Vec<Waiter> {
        self.lock().drain().map(|(_, waiter)| waiter).collect()
    }

    /// Hand a reply over to the request it answers. Returns `false` if nobody was waiting for it.
    pub(super) fn dispatch(&self, reply: Incoming) -> bool {
        let correlation_id = match reply.correlation_id() {
            Some(id) => id.clone(),
            None => {
                tracing::warn!("Dropping a reply without correlation id");
                return false;
            }
        };
        match self.remove(&correlation_id) {
            Some(Waiter::Blocking(sender)) => {
                if sender.send(reply).is_err() {
                    tracing::warn!(%correlation_id, "Reply arrived after its requester gave up");
                    return false;
                }
                true
            }
            Some(Waiter::Callback { callback, resolved }) => {
                resolved.cancel();
                run_callback(callback, Ok(reply));
                true
            }
            None => {
                tracing::warn!(%correlation_id, "Dropping an unmatched reply");
                false
            }
        }
    }
}

/// Removes a blocking request's entry when it goes out of scope, however the request ended.
pub(super) struct Registration<'a> {
    pending: &'a PendingReplies,
    correlation_id: CorrelationId,
}

impl<'a> Registration<'a> {
    pub(super) fn new(pending: &'a PendingReplies, correlation_id: CorrelationId) -> Self {
        Self {
            pending,
            correlation_id,
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}
