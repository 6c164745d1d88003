//! Facilities to consume messages from one or more destinations. Check out [`ConsumerPool`] as a
//! starting point.
pub use builders::{
    ConsumerPool, ConsumerPoolBuilder, ConsumerPoolConfigurationBuilder, DestinationHandler,
    DestinationHandlerBuilder,
};
pub use error::{ConsumerError, ErrorType, HandlerError};
pub use handler::{AsyncClosure, ClosureHandler, Handler};
pub use pre_start_hook::ConsumerPreStartHook;
pub use worker::{ConsumeMode, WorkerState, WorkerStatus};

mod builders;
mod error;
mod handler;
pub mod hooks;
mod pre_start_hook;
mod worker;
