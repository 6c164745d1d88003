use super::{fatal, transient, RecordingHandler};
use crate::helpers::{eventually, get_test_broker, unique_destination};
use carrot_courier::broker::AckMode;
use carrot_courier::consumers::{
    ConsumeMode, ConsumerError, ConsumerPool, DestinationHandler, HandlerError, WorkerState,
};
use carrot_courier::message::{Incoming, Message, PropertyValue};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn consumer_pool(
    pool: &carrot_courier::pool::ConnectionPool,
    destination: &str,
    ack_mode: AckMode,
    mode: ConsumeMode,
    handler: RecordingHandler,
) -> ConsumerPool {
    ConsumerPool::builder(pool.clone())
        .ack_mode(ack_mode)
        .consume_mode(mode)
        .receive_timeout(Duration::from_millis(50))
        .destination_handler(DestinationHandler::builder(destination).raw_handler(handler))
        .build()
}

async fn redelivers_after_a_transient_error(ack_mode: AckMode, mode: ConsumeMode) {
    // Arrange
    let test = get_test_broker(2).await;
    let destination = unique_destination();
    let handler = RecordingHandler::failing(1, transient);
    let consumers = consumer_pool(&test.pool, &destination, ack_mode, mode, handler.clone());
    test.broker.enqueue(&destination, Message::new("order-1"));

    // Act
    consumers.start().await.unwrap();
    assert!(eventually(|| handler.count() == 2).await);
    consumers.stop().await;

    // Assert
    assert_eq!(handler.delivery_counts(), vec![1, 2]);
    assert_eq!(test.broker.queue_depth(&destination), 0);
    assert_eq!(test.broker.open_sessions(), 0);
}

#[tokio::test]
async fn polling_client_acknowledged_consumers_get_failed_messages_again() {
    redelivers_after_a_transient_error(AckMode::Client, ConsumeMode::Poll).await;
}

#[tokio::test]
async fn polling_transacted_consumers_get_failed_messages_again() {
    redelivers_after_a_transient_error(AckMode::Transacted, ConsumeMode::Poll).await;
}

#[tokio::test]
async fn push_client_acknowledged_consumers_get_failed_messages_again() {
    redelivers_after_a_transient_error(AckMode::Client, ConsumeMode::Push).await;
}

#[tokio::test]
async fn push_transacted_consumers_get_failed_messages_again() {
    redelivers_after_a_transient_error(AckMode::Transacted, ConsumeMode::Push).await;
}

#[tokio::test]
async fn auto_acknowledged_messages_are_never_redelivered() {
    // Arrange
    let test = get_test_broker(2).await;
    let destination = unique_destination();
    let handler = RecordingHandler::failing(1, transient);
    let consumers = consumer_pool(
        &test.pool,
        &destination,
        AckMode::Auto,
        ConsumeMode::Poll,
        handler.clone(),
    );
    test.broker.enqueue(&destination, Message::new("order-1"));

    // Act
    consumers.start().await.unwrap();
    assert!(eventually(|| handler.count() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    consumers.stop().await;

    // Assert
    assert_eq!(handler.count(), 1);
    assert_eq!(test.broker.queue_depth(&destination), 0);
}

#[tokio::test]
async fn fatal_errors_drop_the_message() {
    for ack_mode in [AckMode::Client, AckMode::Transacted] {
        // Arrange
        let test = get_test_broker(2).await;
        let destination = unique_destination();
        let handler = RecordingHandler::failing(1, fatal);
        let consumers = consumer_pool(
            &test.pool,
            &destination,
            ack_mode,
            ConsumeMode::Poll,
            handler.clone(),
        );
        test.broker.enqueue(&destination, Message::new("malformed"));

        // Act
        consumers.start().await.unwrap();
        assert!(eventually(|| handler.count() == 1).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        consumers.stop().await;

        // Assert
        assert_eq!(handler.count(), 1, "{ack_mode} redelivered a fatal failure");
        assert_eq!(test.broker.queue_depth(&destination), 0);
    }
}

#[tokio::test]
async fn panicking_handlers_do_not_kill_the_worker() {
    // Arrange
    let test = get_test_broker(2).await;
    let destination = unique_destination();
    let panicked = Arc::new(AtomicBool::new(false));
    let handled = Arc::new(AtomicBool::new(false));
    let (p, h) = (Arc::clone(&panicked), Arc::clone(&handled));
    let consumers = ConsumerPool::builder(test.pool.clone())
        .receive_timeout(Duration::from_millis(50))
        .destination_handler(DestinationHandler::builder(&destination).raw_handler(
            PanicOnce {
                panicked: p,
                handled: h,
            },
        ))
        .build();
    test.broker.enqueue(&destination, Message::new("boom"));

    // Act
    consumers.start().await.unwrap();
    assert!(eventually(|| handled.load(Ordering::SeqCst)).await);
    consumers.stop().await;

    // Assert
    assert!(panicked.load(Ordering::SeqCst));
    assert_eq!(test.broker.queue_depth(&destination), 0);
}

struct PanicOnce {
    panicked: Arc<AtomicBool>,
    handled: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl carrot_courier::consumers::Handler for PanicOnce {
    async fn handle(&self, _incoming: &Incoming) -> Result<(), HandlerError> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("The handler blew up");
        }
        self.handled.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn every_message_is_processed_once_across_workers() {
    // Arrange
    let test = get_test_broker(2).await;
    let destination = unique_destination();
    let handler = RecordingHandler::succeeding();
    let consumers = ConsumerPool::builder(test.pool.clone())
        .threads_per_destination(3)
        .receive_timeout(Duration::from_millis(50))
        .destination_handler(DestinationHandler::builder(&destination).raw_handler(handler.clone()))
        .build();
    for i in 0..30 {
        test.broker.enqueue(&destination, Message::new(i.to_string()));
    }

    // Act
    consumers.start().await.unwrap();
    assert!(eventually(|| handler.count() == 30).await);
    let statuses = consumers.worker_statuses().await;
    consumers.stop().await;

    // Assert
    let payloads: BTreeSet<String> = handler
        .deliveries
        .lock()
        .unwrap()
        .iter()
        .map(|(payload, _)| payload.clone())
        .collect();
    assert_eq!(payloads.len(), 30);
    assert_eq!(statuses.len(), 3);
    assert!(statuses.iter().all(|s| s.state == WorkerState::Running));
    assert!(consumers.worker_statuses().await.is_empty());
    assert_eq!(test.broker.open_sessions(), 0);
}

#[tokio::test]
async fn stopping_waits_for_the_message_in_flight() {
    // Arrange
    let test = get_test_broker(2).await;
    let destination = unique_destination();
    let finished = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicBool::new(false));
    let (f, s) = (Arc::clone(&finished), Arc::clone(&started));
    let consumers = ConsumerPool::builder(test.pool.clone())
        .receive_timeout(Duration::from_millis(50))
        .destination_handler(DestinationHandler::builder(&destination).raw_handler(SlowHandler {
            started: s,
            finished: f,
        }))
        .build();
    test.broker.enqueue(&destination, Message::new("slow"));

    // Act
    consumers.start().await.unwrap();
    assert!(eventually(|| started.load(Ordering::SeqCst)).await);
    consumers.stop().await;

    // Assert
    assert!(finished.load(Ordering::SeqCst));
    // Acknowledged before the session closed: nothing comes back.
    assert_eq!(test.broker.queue_depth(&destination), 0);
    assert!(!consumers.is_running().await);
}

struct SlowHandler {
    started: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl carrot_courier::consumers::Handler for SlowHandler {
    async fn handle(&self, _incoming: &Incoming) -> Result<(), HandlerError> {
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn closures_can_be_used_as_handlers() {
    // Arrange
    async fn handle(incoming: &Incoming) -> Result<(), HandlerError> {
        if incoming.property("tenant").and_then(|v| v.as_str()) == Some("acme") {
            Ok(())
        } else {
            Err(HandlerError::fatal(anyhow::anyhow!("Unknown tenant")))
        }
    }
    let test = get_test_broker(2).await;
    let destination = unique_destination();
    let consumers = ConsumerPool::builder(test.pool.clone())
        .receive_timeout(Duration::from_millis(50))
        .destination_handler(DestinationHandler::builder(&destination).handler(handle))
        .build();
    test.producers
        .send_sync(&destination, Message::new("x").with_property("tenant", "acme"))
        .await
        .unwrap();

    // Act
    consumers.start().await.unwrap();
    let broker = test.broker.clone();
    let drained = eventually(|| broker.queue_depth(&destination) == 0).await;
    consumers.stop().await;

    // Assert
    assert!(drained);
}

#[tokio::test]
async fn a_pool_cannot_be_started_twice() {
    let test = get_test_broker(2).await;
    let consumers = ConsumerPool::builder(test.pool.clone())
        .destination_handler(
            DestinationHandler::builder(unique_destination())
                .raw_handler(RecordingHandler::succeeding()),
        )
        .build();

    consumers.start().await.unwrap();
    let outcome = consumers.start().await;
    consumers.stop().await;

    assert!(matches!(outcome, Err(ConsumerError::AlreadyStarted)));
}

#[tokio::test]
async fn shutting_the_connection_pool_down_stops_the_workers() {
    // Arrange
    let test = get_test_broker(2).await;
    let consumers = ConsumerPool::builder(test.pool.clone())
        .receive_timeout(Duration::from_millis(50))
        .destination_handler(
            DestinationHandler::builder(unique_destination())
                .raw_handler(RecordingHandler::succeeding()),
        )
        .build();
    consumers.start().await.unwrap();

    // Act
    test.pool.shutdown().await;

    // Assert
    let broker = test.broker.clone();
    assert!(eventually(|| broker.open_sessions() == 0).await);
    consumers.stop().await;
    assert!(consumers.worker_statuses().await.is_empty());
}

#[tokio::test]
async fn properties_survive_a_transactional_send() {
    // Arrange
    let test = get_test_broker(2).await;
    let destination = unique_destination();
    let recorder = PropertyRecorder::default();
    let seen = Arc::clone(&recorder.seen);
    let consumers = ConsumerPool::builder(test.pool.clone())
        .receive_timeout(Duration::from_millis(50))
        .destination_handler(DestinationHandler::builder(&destination).raw_handler(recorder))
        .build();
    let batch = (0..3)
        .map(|i| {
            Message::new(i.to_string())
                .with_property("batchId", "b1")
                .with_property("batchSize", 3)
        })
        .collect();

    // Act
    test.producers
        .send_transactional(&destination, batch)
        .await
        .unwrap();
    consumers.start().await.unwrap();
    assert!(eventually(|| seen.lock().unwrap().len() == 3).await);
    consumers.stop().await;

    // Assert
    for (batch_id, batch_size) in seen.lock().unwrap().iter() {
        assert_eq!(batch_id.as_ref().and_then(|v| v.as_str()), Some("b1"));
        assert_eq!(batch_size.as_ref().and_then(|v| v.as_int()), Some(3));
    }
}

type BatchProperties = (Option<PropertyValue>, Option<PropertyValue>);

#[derive(Default)]
struct PropertyRecorder {
    seen: Arc<std::sync::Mutex<Vec<BatchProperties>>>,
}

#[async_trait::async_trait]
impl carrot_courier::consumers::Handler for PropertyRecorder {
    async fn handle(&self, incoming: &Incoming) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push((
            incoming.property("batchId").cloned(),
            incoming.property("batchSize").cloned(),
        ));
        Ok(())
    }
}

#[tokio::test]
async fn stopping_interrupts_workers_blocked_on_receive() {
    // Arrange
    let test = get_test_broker(2).await;
    let consumers = ConsumerPool::builder(test.pool.clone())
        .threads_per_destination(4)
        .receive_timeout(Duration::from_secs(30))
        .destination_handler(
            DestinationHandler::builder(unique_destination())
                .raw_handler(RecordingHandler::succeeding()),
        )
        .build();
    consumers.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Act
    let stopped = tokio::time::timeout(Duration::from_secs(1), consumers.stop()).await;

    // Assert
    assert!(stopped.is_ok());
    assert_eq!(test.broker.open_sessions(), 0);
}

#[tokio::test]
async fn destination_prefetch_counts_override_the_pool_one() {
    // Arrange
    let test = get_test_broker(2).await;
    let orders = unique_destination();
    let invoices = unique_destination();
    let consumers = ConsumerPool::builder(test.pool.clone())
        .prefetch_count(5)
        .consume_mode(ConsumeMode::Push)
        .destination_handler(
            DestinationHandler::builder(&orders).raw_handler(RecordingHandler::succeeding()),
        )
        .destination_handler(
            DestinationHandler::builder(&invoices)
                .prefetch_count(12)
                .threads(2)
                .raw_handler(RecordingHandler::succeeding()),
        )
        .build();

    // Act
    consumers.start().await.unwrap();
    consumers.stop().await;

    // Assert
    assert_eq!(test.broker.consumer_prefetch_counts(&orders), vec![5]);
    assert_eq!(test.broker.consumer_prefetch_counts(&invoices), vec![12, 12]);
}
