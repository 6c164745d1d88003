use carrot_courier::broker::memory::MemoryBroker;
use carrot_courier::consumers::{ConsumerPool, DestinationHandler, HandlerError};
use carrot_courier::message::{Incoming, Message};
use carrot_courier::pool::ConnectionPool;
use carrot_courier::publishers::ProducerPool;
use carrot_courier::request_reply::{Replier, ReplyingHandler, RequestReplyCoordinator};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // We are using the in-process broker, so the demo runs without a RabbitMq instance.
    // Swap it for `carrot_courier::amqp::ConnectionFactory` to talk to a real broker: nothing
    // else changes.
    let broker = MemoryBroker::new();

    // Every producer, consumer and coordinator borrows its sessions from the same pool.
    // `max_size` caps the number of sessions used to send messages: when all of them are
    // borrowed, senders wait (up to the acquire timeout) for one to be released.
    // Consumers get a dedicated session per worker, on top of that bound.
    let connection_pool = ConnectionPool::builder(broker)
        .max_size(4)
        .max_connections(1)
        .build()
        .await?;
    let producers = ProducerPool::builder(connection_pool.clone())
        .publish_timeout(Duration::from_secs(3))
        .build();

    // The replying side is a regular consumer.
    // `ReplyingHandler` sends whatever the responder returns back to the reply destination of
    // the request, with the same correlation id.
    let responder = |request: &Incoming| -> Result<Message, HandlerError> {
        Ok(Message::new(format!("pong:{}", request.payload_str())))
    };
    let replier = ConsumerPool::builder(connection_pool.clone())
        .threads_per_destination(2)
        .destination_handler(
            DestinationHandler::builder("ping")
                .raw_handler(ReplyingHandler::new(Replier::new(producers.clone()), responder)),
        )
        .build();
    replier.start().await?;

    // The requesting side creates a temporary reply destination and listens on it.
    let coordinator = RequestReplyCoordinator::builder(producers.clone())
        .start()
        .await?;

    // Wait for the reply...
    let reply = coordinator
        .request_sync("ping", Message::new("hello"), Duration::from_secs(1))
        .await?;
    println!("Synchronous reply: {}", reply.payload_str());

    // ...or get called back when it arrives.
    let (sender, receiver) = tokio::sync::oneshot::channel();
    coordinator
        .request_async("ping", Message::new("world"), Duration::from_secs(1), |outcome| {
            let _ = sender.send(outcome);
        })
        .await?;
    println!("Asynchronous reply: {}", receiver.await??.payload_str());

    // Nobody consumes `nowhere`: the request times out.
    let outcome = coordinator
        .request_sync("nowhere", Message::new("anyone?"), Duration::from_millis(200))
        .await;
    assert!(outcome.is_err());

    coordinator.shutdown().await;
    replier.stop().await;
    connection_pool.shutdown().await;
    Ok(())
}
