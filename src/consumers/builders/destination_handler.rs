use crate::broker::{AckMode, Selector};
use crate::consumers::{
    handler::{AsyncClosure, ClosureHandler},
    ConsumeMode, ConsumerPreStartHook, Handler,
};
use std::sync::Arc;

/// A handler processing the messages of a single destination.
///
/// Use [`DestinationHandler::builder`] to start composing a `DestinationHandler` using a fluent
/// builder API.
///
/// # `DestinationHandler` vs `ConsumerPool`
///
/// A `DestinationHandler` is always part of a [`ConsumerPool`]: it inherits its pool-level
/// configuration, and can override part of it (acknowledgement mode, consume mode, number of
/// workers, prefetch count, pre-start hooks).
///
/// [`ConsumerPool`]: super::ConsumerPool
pub struct DestinationHandler {
    pub(super) destination: String,
    pub(super) threads: Option<usize>,
    pub(super) prefetch_count: Option<u16>,
    pub(super) ack_mode: Option<AckMode>,
    pub(super) consume_mode: Option<ConsumeMode>,
    pub(super) selector: Option<Selector>,
    pub(super) pre_start_hooks: Vec<Arc<dyn ConsumerPreStartHook>>,
    pub(super) handler: Arc<dyn Handler>,
}

impl DestinationHandler {
    /// Start building a [`DestinationHandler`] for the destination named `destination`.
    pub fn builder<T: Into<String>>(destination: T) -> DestinationHandlerBuilder {
        DestinationHandlerBuilder::new(destination.into())
    }
}

/// A builder to compose a [`DestinationHandler`] with a fluent API.
///
/// Use [`DestinationHandler::builder`] as entrypoint.
pub struct DestinationHandlerBuilder {
    destination: String,
    threads: Option<usize>,
    prefetch_count: Option<u16>,
    ack_mode: Option<AckMode>,
    consume_mode: Option<ConsumeMode>,
    selector: Option<Selector>,
    pre_start_hooks: Vec<Arc<dyn ConsumerPreStartHook>>,
}

impl DestinationHandlerBuilder {
    fn new(destination: String) -> Self {
        Self {
            destination,
            threads: None,
            prefetch_count: None,
            ack_mode: None,
            consume_mode: None,
            selector: None,
            pre_start_hooks: vec![],
        }
    }

    /// Overrides the pool-level number of workers for this destination.
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Configure the prefetch count of this destination's workers.
    /// If not configured, the handler inherits the prefetch count of its pool.
    #[must_use]
    pub fn prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = Some(prefetch_count);
        self
    }

    /// Overrides the pool-level acknowledgement mode for this destination.
    #[must_use]
    pub fn ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = Some(ack_mode);
        self
    }

    /// Overrides the pool-level consume mode for this destination.
    #[must_use]
    pub fn consume_mode(mut self, mode: ConsumeMode) -> Self {
        self.consume_mode = Some(mode);
        self
    }

    /// Only receive the messages matching `selector`. Not every transport supports selectors.
    #[must_use]
    pub fn selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Pre-start hooks are executed _before_ workers start receiving from the destination,
    /// e.g. to create it.
    ///
    /// If no pre-start hook is specified at the `DestinationHandler` level, the hooks
    /// specified at the [`ConsumerPool`](super::ConsumerPool) level are executed.
    #[must_use]
    pub fn with_pre_start_hook<H: ConsumerPreStartHook>(mut self, hook: H) -> Self {
        self.pre_start_hooks.push(Arc::new(hook));
        self
    }

    /// Set the handler logic to a function or closure.
    ///
    /// ```rust
    /// use carrot_courier::consumers::{DestinationHandler, HandlerError};
    /// use carrot_courier::message::Incoming;
    ///
    /// async fn handle(incoming: &Incoming) -> Result<(), HandlerError> {
    ///     println!("{}", incoming.payload_str());
    ///     Ok(())
    /// }
    ///
    /// let handler = DestinationHandler::builder("orders").handler(handle);
    /// # drop(handler);
    /// ```
    pub fn handler<F>(self, handler: F) -> DestinationHandler
    where
        F: for<'a> AsyncClosure<'a>,
    {
        self.raw_handler(ClosureHandler(handler))
    }

    /// Set the handler logic to a type implementing [`Handler`].
    pub fn raw_handler<H: Handler>(self, handler: H) -> DestinationHandler {
        self.raw_arc_handler(Arc::new(handler))
    }

    /// Set the handler logic to a shared [`Handler`].
    pub fn raw_arc_handler(self, handler: Arc<dyn Handler>) -> DestinationHandler {
        DestinationHandler {
            destination: self.destination,
            threads: self.threads,
            prefetch_count: self.prefetch_count,
            ack_mode: self.ack_mode,
            consume_mode: self.consume_mode,
            selector: self.selector,
            pre_start_hooks: self.pre_start_hooks,
            handler,
        }
    }
}
