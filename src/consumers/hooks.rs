//! A collection of pre-start hooks.
//!
//! ```
//! use carrot_courier::consumers::hooks::DeclareDestination;
//! use carrot_courier::consumers::DestinationHandler;
//! use carrot_courier::consumers::HandlerError;
//! use carrot_courier::message::Incoming;
//!
//! async fn handle(_incoming: &Incoming) -> Result<(), HandlerError> {
//!     Ok(())
//! }
//!
//! // The `orders` queue is created, if missing, before the consumer starts.
//! let handler = DestinationHandler::builder("orders")
//!     .with_pre_start_hook(DeclareDestination)
//!     .handler(handle);
//! # drop(handler);
//! ```
use crate::broker::Session;
use crate::consumers::ConsumerPreStartHook;
use crate::message::Destination;
use anyhow::Context;

/// Declares the consumed destination if it does not exist yet.
pub struct DeclareDestination;

#[async_trait::async_trait]
impl ConsumerPreStartHook for DeclareDestination {
    async fn run(
        &self,
        session: &dyn Session,
        destination: &Destination,
    ) -> Result<(), anyhow::Error> {
        session
            .declare_destination(destination)
            .await
            .with_context(|| format!("Failed to declare `{destination}`"))
    }
}

/// Declares additional destinations the consumer depends on, e.g. the ones it forwards to.
pub struct DeclareDestinations(pub Vec<String>);

#[async_trait::async_trait]
impl ConsumerPreStartHook for DeclareDestinations {
    async fn run(
        &self,
        session: &dyn Session,
        _destination: &Destination,
    ) -> Result<(), anyhow::Error> {
        for name in &self.0 {
            DeclareDestination.run(session, &Destination::from(name.as_str())).await?;
        }
        Ok(())
    }
}
