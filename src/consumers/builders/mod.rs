mod consumer_pool;
mod consumer_pool_configuration;
mod destination_handler;

pub use consumer_pool::{ConsumerPool, ConsumerPoolBuilder};
pub use consumer_pool_configuration::ConsumerPoolConfigurationBuilder;
pub use destination_handler::{DestinationHandler, DestinationHandlerBuilder};
