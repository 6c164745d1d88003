use crate::broker::AckMode;
use crate::configuration::ConsumerSettings;
use crate::consumers::builders::consumer_pool::ConsumerPoolBuilder;
use crate::consumers::builders::destination_handler::DestinationHandler;
use crate::consumers::{ConsumeMode, ConsumerPreStartHook};
use crate::pool::ConnectionPool;
use std::sync::Arc;
use std::time::Duration;

/// Pool-level configuration values for a [`ConsumerPool`](super::ConsumerPool).
///
/// Use [`ConsumerPoolConfigurationBuilder`] to build an instance of `ConsumerPoolConfiguration`.
pub(super) struct ConsumerPoolConfiguration {
    pub(super) connection_pool: ConnectionPool,
    pub(super) destination_prefix: Option<String>,
    pub(super) threads_per_destination: usize,
    pub(super) prefetch_count: u16,
    pub(super) receive_timeout: Duration,
    pub(super) ack_mode: AckMode,
    pub(super) consume_mode: ConsumeMode,
    pub(super) pre_start_hooks: Vec<Arc<dyn ConsumerPreStartHook>>,
}

/// A builder for pool-level configuration of a [`ConsumerPool`](super::ConsumerPool).
///
/// Use [`ConsumerPool::builder`](super::ConsumerPool::builder) as entrypoint.
pub struct ConsumerPoolConfigurationBuilder(ConsumerPoolConfiguration);

impl ConsumerPoolConfigurationBuilder {
    pub(super) fn new(connection_pool: ConnectionPool) -> Self {
        let defaults = ConsumerSettings::default();
        Self(ConsumerPoolConfiguration {
            connection_pool,
            destination_prefix: None,
            threads_per_destination: defaults.threads_per_destination,
            prefetch_count: defaults.prefetch_count,
            receive_timeout: defaults.receive_timeout(),
            ack_mode: defaults.ack_mode,
            consume_mode: defaults.mode,
            pre_start_hooks: Vec::new(),
        })
    }

    /// Apply every setting from a [`ConsumerSettings`].
    #[must_use]
    pub fn settings(self, settings: &ConsumerSettings) -> Self {
        self.threads_per_destination(settings.threads_per_destination)
            .prefetch_count(settings.prefetch_count)
            .receive_timeout(settings.receive_timeout())
            .ack_mode(settings.ack_mode)
            .consume_mode(settings.mode)
    }

    /// Add a prefix to the name of every consumed destination.
    ///
    /// E.g. `test` as prefix will give you `test_X` destination names.
    #[must_use]
    pub fn destination_prefix<T: Into<String>>(mut self, prefix: T) -> Self {
        self.0.destination_prefix = Some(prefix.into());
        self
    }

    /// How many workers, each with its own session, consume every destination.
    /// Defaults to 1.
    #[must_use]
    pub fn threads_per_destination(mut self, threads: usize) -> Self {
        self.0.threads_per_destination = threads;
        self
    }

    /// Configure the prefetch count of every worker's session.
    /// If not configured, the prefetch count is set to a default value of 50.
    #[must_use]
    pub fn prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.0.prefetch_count = prefetch_count;
        self
    }

    /// How long a polling worker blocks on a single receive before checking whether it should
    /// stop. Defaults to 5 seconds.
    #[must_use]
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.0.receive_timeout = timeout;
        self
    }

    /// Defaults to [`AckMode::Client`].
    #[must_use]
    pub fn ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.0.ack_mode = ack_mode;
        self
    }

    /// Defaults to [`ConsumeMode::Poll`].
    #[must_use]
    pub fn consume_mode(mut self, mode: ConsumeMode) -> Self {
        self.0.consume_mode = mode;
        self
    }

    /// Pre-start hooks run before the workers of a destination start receiving.
    ///
    /// They are ignored for destinations that register hooks of their own.
    #[must_use]
    pub fn with_pre_start_hook<H: ConsumerPreStartHook>(mut self, hook: H) -> Self {
        self.0.pre_start_hooks.push(Arc::new(hook));
        self
    }

    /// Finalise the pool-level configuration and register the first destination.
    pub fn destination_handler(self, handler: DestinationHandler) -> ConsumerPoolBuilder {
        ConsumerPoolBuilder {
            pool_configuration: self.0,
            destination_handlers: vec![handler],
        }
    }
}
