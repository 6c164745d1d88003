use super::ProducerError;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// The outcome of an asynchronous send, available once the broker confirmed (or refused) the
/// message.
///
/// Await it, or register a callback with [`SendConfirmation::on_complete`]. Dropping it does not
/// cancel the send.
#[must_use = "dropping a `SendConfirmation` discards the outcome of the send"]
pub struct SendConfirmation {
    receiver: oneshot::Receiver<Result<(), ProducerError>>,
}

impl SendConfirmation {
    pub(super) fn new(receiver: oneshot::Receiver<Result<(), ProducerError>>) -> Self {
        Self { receiver }
    }

    /// Invoke `callback` exactly once, with the outcome of the send, on a background task.
    pub fn on_complete<F>(self, callback: F)
    where
        F: FnOnce(Result<(), ProducerError>) + Send + 'static,
    {
        tokio::spawn(async move { callback(self.await) });
    }
}

impl Future for SendConfirmation {
    type Output = Result<(), ProducerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or_else(|_| Err(ProducerError::ConfirmationLost)))
    }
}
