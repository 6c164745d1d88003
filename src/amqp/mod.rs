//! The RabbitMq transport, built on [`lapin`].

pub mod configuration;
pub mod convenience;
mod factory;
mod session;

pub use factory::ConnectionFactory;
pub use lapin::{options, types, BasicProperties};
