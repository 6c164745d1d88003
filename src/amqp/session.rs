//! AMQP connections and channels behind the broker capability traits.
//!
//! A session is an AMQP channel:
//! - auto and client sessions run in publisher-confirm mode;
//! - transacted sessions run in `tx` mode, where commit and rollback cover both publishes and
//!   acknowledgements.
use super::convenience::{to_basic_properties, to_incoming};
use crate::broker::{
    AckMode, BrokerError, Connection, IncomingStream, MessageConsumer, PendingConfirm, Selector,
    Session,
};
use crate::message::{Destination, Incoming, Message};
use futures_util::{stream, StreamExt, TryStreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRecoverOptions, ConfirmSelectOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    ChannelState, ConnectionState,
};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Reply code of a normal channel or connection shutdown.
const REPLY_SUCCESS: u16 = 200;

/// Pause between two `basic.get` on an empty queue.
const BASIC_GET_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(super) struct AmqpConnection {
    inner: lapin::Connection,
}

impl AmqpConnection {
    pub(super) fn new(inner: lapin::Connection) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl Connection for AmqpConnection {
    async fn create_session(&self, ack_mode: AckMode) -> Result<Box<dyn Session>, BrokerError> {
        let channel = self.inner.create_channel().await?;
        match ack_mode {
            AckMode::Transacted => channel.tx_select().await?,
            AckMode::Auto | AckMode::Client => {
                channel
                    .confirm_select(ConfirmSelectOptions { nowait: false })
                    .await?
            }
        }
        Ok(Box::new(AmqpSession { channel, ack_mode }))
    }

    fn is_healthy(&self) -> bool {
        matches!(self.inner.status().state(), ConnectionState::Connected)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.is_healthy() {
            self.inner.close(REPLY_SUCCESS, "Closed by the pool").await?;
        }
        Ok(())
    }
}

struct AmqpSession {
    channel: lapin::Channel,
    ack_mode: AckMode,
}

#[async_trait::async_trait]
impl Session for AmqpSession {
    fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    fn is_open(&self) -> bool {
        matches!(self.channel.status().state(), ChannelState::Connected)
    }

    async fn publish(
        &self,
        destination: &Destination,
        message: Message,
    ) -> Result<PendingConfirm, BrokerError> {
        let options = BasicPublishOptions {
            // Unroutable messages come back with the confirmation, which `tx` mode does not have.
            mandatory: !self.ack_mode.is_transacted(),
            // The immediate flag was dropped in RabbitMQ 3.0, setting it causes a not-supported error.
            immediate: false,
        };
        let properties = to_basic_properties(&message);
        let confirm = self
            .channel
            .basic_publish("", destination.as_str(), options, &message.payload, properties)
            .await?;
        let destination = destination.clone();
        Ok(Box::pin(async move {
            match confirm.await? {
                // Reply Code 312 - NO_ROUTE
                Confirmation::Ack(Some(returned)) if returned.reply_code == 312 => {
                    Err(BrokerError::Rejected(format!(
                        "no queue named `{destination}` to route the message to"
                    )))
                }
                Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
                Confirmation::Nack(_) => Err(BrokerError::Rejected(format!(
                    "RabbitMq nacked the message sent to `{destination}`"
                ))),
            }
        }))
    }

    async fn commit(&self) -> Result<(), BrokerError> {
        if !self.ack_mode.is_transacted() {
            return Err(BrokerError::Unsupported("commit on a non-transacted session"));
        }
        Ok(self.channel.tx_commit().await?)
    }

    async fn rollback(&self) -> Result<(), BrokerError> {
        if !self.ack_mode.is_transacted() {
            return Err(BrokerError::Unsupported(
                "rollback on a non-transacted session",
            ));
        }
        self.channel.tx_rollback().await?;
        // Rolled back acknowledgements leave their messages unacked on the channel.
        self.channel
            .basic_recover(BasicRecoverOptions { requeue: true })
            .await?;
        Ok(())
    }

    async fn acknowledge(&self, incoming: &Incoming) -> Result<(), BrokerError> {
        match self.ack_mode {
            AckMode::Auto => Ok(()),
            AckMode::Client | AckMode::Transacted => Ok(self
                .channel
                .basic_ack(incoming.delivery_tag(), BasicAckOptions::default())
                .await?),
        }
    }

    async fn recover(&self, incoming: &Incoming) -> Result<(), BrokerError> {
        match self.ack_mode {
            AckMode::Client => {
                let options = BasicNackOptions {
                    multiple: false,
                    requeue: true,
                };
                Ok(self
                    .channel
                    .basic_nack(incoming.delivery_tag(), options)
                    .await?)
            }
            AckMode::Auto | AckMode::Transacted => Ok(()),
        }
    }

    async fn set_prefetch_count(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<Selector>,
    ) -> Result<Box<dyn MessageConsumer>, BrokerError> {
        if selector.is_some() {
            return Err(BrokerError::Unsupported("message selectors"));
        }
        Ok(Box::new(AmqpConsumer {
            channel: self.channel.clone(),
            destination: destination.clone(),
            no_ack: self.ack_mode == AckMode::Auto,
        }))
    }

    async fn declare_destination(&self, destination: &Destination) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(destination.as_str(), options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn create_temporary_destination(&self) -> Result<Destination, BrokerError> {
        // An empty name lets the broker pick one.
        let options = QueueDeclareOptions {
            exclusive: true,
            auto_delete: true,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .channel
            .queue_declare("", options, FieldTable::default())
            .await?;
        Ok(Destination::new(queue.name().as_str()))
    }

    async fn delete_destination(&self, destination: &Destination) -> Result<(), BrokerError> {
        self.channel
            .queue_delete(destination.as_str(), QueueDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            self.channel.close(REPLY_SUCCESS, "Session closed").await?;
        }
        Ok(())
    }
}

struct AmqpConsumer {
    channel: lapin::Channel,
    destination: Destination,
    no_ack: bool,
}

#[async_trait::async_trait]
impl MessageConsumer for AmqpConsumer {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Incoming>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let options = BasicGetOptions {
                no_ack: self.no_ack,
            };
            let fetched = self
                .channel
                .basic_get(self.destination.as_str(), options)
                .await?;
            if let Some(fetched) = fetched {
                return Ok(Some(to_incoming(&self.destination, fetched.delivery)));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(BASIC_GET_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    fn into_stream(self: Box<Self>) -> IncomingStream {
        let AmqpConsumer {
            channel,
            destination,
            no_ack,
        } = *self;
        let consumer_tag = format!("carrot-courier-{}", Uuid::new_v4());
        stream::once(async move {
            let options = BasicConsumeOptions {
                no_ack,
                ..BasicConsumeOptions::default()
            };
            let deliveries = channel
                .basic_consume(
                    destination.as_str(),
                    &consumer_tag,
                    options,
                    FieldTable::default(),
                )
                .await?;
            Ok::<_, BrokerError>(deliveries.map(move |delivery| {
                delivery
                    .map(|delivery| to_incoming(&destination, delivery))
                    .map_err(BrokerError::from)
            }))
        })
        .try_flatten()
        .boxed()
    }
}
