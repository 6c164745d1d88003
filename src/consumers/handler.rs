//! The `Handler` trait is heavily inspired by `tide`'s approach to endpoint handlers.
use crate::consumers::HandlerError;
use crate::message::Incoming;
use std::future::Future;
use std::sync::Arc;

/// Implementers of the `Handler` trait process the messages received by a
/// [`ConsumerPool`](crate::consumers::ConsumerPool).
///
/// # Scope
///
/// `handle` does not get access to the underlying session.
/// The pool takes care of acknowledging, committing, recovering or rolling back according to
/// the outcome of processing (check out [`HandlerError`] for more details).
///
/// # Implementors
///
/// While you can implement `Handler` for a struct or enum, most of the time you will be relying
/// on the implementation for async functions with a matching signature, through
/// [`ClosureHandler`].
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, incoming: &Incoming) -> Result<(), HandlerError>;
}

/// E.g. `Box<dyn Handler>`.
#[async_trait::async_trait]
impl<H> Handler for Box<H>
where
    H: Handler + ?Sized,
{
    async fn handle(&self, incoming: &Incoming) -> Result<(), HandlerError> {
        H::handle(self, incoming).await
    }
}

#[async_trait::async_trait]
impl<H> Handler for Arc<H>
where
    H: Handler + ?Sized,
{
    async fn handle(&self, incoming: &Incoming) -> Result<(), HandlerError> {
        H::handle(self, incoming).await
    }
}

/// `AsyncClosure` is implemented for all functions of the form:
/// ```ignore
/// async fn(incoming: &Incoming) -> Result<(), impl Into<HandlerError>>;
/// ```
///
/// When combined with the [`ClosureHandler`] type, you get a [`Handler`].
/// `DestinationHandlerBuilder::handler` performs this wrapping for you.
pub trait AsyncClosure<'a>: Send + Sync + 'static {
    type Output: Future<Output = Result<(), Self::Err>> + Send + 'a;
    type Err: Into<HandlerError> + 'static;
    fn call(&'a self, incoming: &'a Incoming) -> Self::Output;
}

impl<'a, F, Fut, Err> AsyncClosure<'a> for F
where
    F: Send + Sync + 'static,
    F: Fn(&'a Incoming) -> Fut,
    Fut: Future<Output = Result<(), Err>> + Send + 'a,
    Err: Into<HandlerError> + 'static,
{
    type Err = Err;
    type Output = Fut;

    fn call(&'a self, incoming: &'a Incoming) -> Self::Output {
        (self)(incoming)
    }
}

/// Wrapper type to turn an [`AsyncClosure`] into a [`Handler`].
pub struct ClosureHandler<H>(pub H);

#[async_trait::async_trait]
impl<F> Handler for ClosureHandler<F>
where
    F: for<'a> AsyncClosure<'a>,
{
    async fn handle(&self, incoming: &Incoming) -> Result<(), HandlerError> {
        self.0.call(incoming).await.map_err(|e| e.into())
    }
}
