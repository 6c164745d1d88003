//! `carrot-courier` gives services pooled, bounded access to a message broker.
//!
//! It covers the usual messaging patterns:
//! - synchronous, asynchronous and transactional sends, with
//!   [`ProducerPool`](crate::publishers::ProducerPool);
//! - polling or push consumers with automatic, client or transacted acknowledgement, with
//!   [`ConsumerPool`](crate::consumers::ConsumerPool);
//! - correlation-based request/reply, with
//!   [`RequestReplyCoordinator`](crate::request_reply::RequestReplyCoordinator).
//!
//! Every one of them borrows its sessions from a shared
//! [`ConnectionPool`](crate::pool::ConnectionPool), which caps how many sessions are open at
//! any time and hands healthy sessions back out once their users are done with them.
//!
//! The broker itself sits behind the traits in [`broker`]. [`amqp::ConnectionFactory`] talks to
//! RabbitMQ through [`lapin`]; [`broker::memory::MemoryBroker`] keeps everything in-process.
//!
//! ## Examples
//!
//! Check the `demos` directory to see the library in action.

pub mod amqp;
pub mod broker;
pub mod configuration;
pub mod consumers;
pub mod message;
pub mod pool;
pub mod publishers;
pub mod request_reply;
