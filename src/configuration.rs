//! Settings for every part of the crate, grouped under [`CourierSettings`].
//!
//! Every struct derives [`serde::Deserialize`]: load them with whatever configuration loader
//! your application already uses. Missing fields fall back to the [`Default`] values.
use crate::amqp::configuration::RabbitMqSettings;
use crate::broker::AckMode;
use crate::consumers::ConsumeMode;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CourierSettings {
    #[serde(default)]
    pub rabbitmq: RabbitMqSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub consumer: ConsumerSettings,
    #[serde(default)]
    pub request_reply: RequestReplySettings,
    /// The destinations consumed by the consumer pool.
    #[serde(default)]
    pub destinations: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum number of pooled sessions, per acknowledgement mode.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub producer_pool_size: usize,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_connections: usize,
    /// How long a producer waits for a free session.
    pub acquire_timeout_ms: u64,
    /// Open every pooled session when the pool is built.
    pub eager_fill: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            producer_pool_size: 10,
            max_connections: 2,
            acquire_timeout_ms: 5_000,
            eager_fill: false,
        }
    }
}

impl PoolSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConsumerSettings {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub threads_per_destination: usize,
    /// How many unacknowledged messages the broker pushes to each worker.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub prefetch_count: u16,
    /// How long a polling worker blocks on a single receive.
    pub receive_timeout_ms: u64,
    pub ack_mode: AckMode,
    pub mode: ConsumeMode,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            threads_per_destination: 1,
            prefetch_count: 50,
            receive_timeout_ms: 5_000,
            ack_mode: AckMode::Client,
            mode: ConsumeMode::Poll,
        }
    }
}

impl ConsumerSettings {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RequestReplySettings {
    pub request_timeout_ms: u64,
    /// Where replies are sent. A temporary destination is created if left unspecified.
    pub shared_reply_destination: Option<String>,
}

impl Default for RequestReplySettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            shared_reply_destination: None,
        }
    }
}

impl RequestReplySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
