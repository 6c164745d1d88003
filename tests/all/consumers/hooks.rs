use super::RecordingHandler;
use crate::helpers::{eventually, get_test_broker, unique_destination};
use carrot_courier::broker::Session;
use carrot_courier::consumers::hooks::{DeclareDestination, DeclareDestinations};
use carrot_courier::consumers::{ConsumerError, ConsumerPool, ConsumerPreStartHook, DestinationHandler};
use carrot_courier::message::{Destination, Message};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
struct CountingHook {
    destinations: Arc<Mutex<Vec<String>>>,
}

impl CountingHook {
    fn count(&self) -> usize {
        self.destinations.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ConsumerPreStartHook for CountingHook {
    async fn run(&self, _session: &dyn Session, destination: &Destination) -> Result<(), anyhow::Error> {
        self.destinations.lock().unwrap().push(destination.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn if_a_destination_level_pre_start_hook_is_provided_the_pool_level_one_is_ignored() {
    // Arrange
    let test = get_test_broker(2).await;
    let pool_hook = CountingHook::default();
    let handler_hook = CountingHook::default();
    let consumers = ConsumerPool::builder(test.pool.clone())
        .with_pre_start_hook(pool_hook.clone())
        // With custom hook
        .destination_handler(
            DestinationHandler::builder(unique_destination())
                .with_pre_start_hook(handler_hook.clone())
                .raw_handler(RecordingHandler::succeeding()),
        )
        // Without custom hook
        .destination_handler(
            DestinationHandler::builder(unique_destination())
                .raw_handler(RecordingHandler::succeeding()),
        )
        .build();

    // Act
    consumers.start().await.unwrap();
    consumers.stop().await;

    // Assert
    assert_eq!(1, pool_hook.count());
    assert_eq!(1, handler_hook.count());
}

#[tokio::test]
async fn hooks_run_once_per_destination_whatever_the_number_of_workers() {
    // Arrange
    let test = get_test_broker(2).await;
    let hook = CountingHook::default();
    let consumers = ConsumerPool::builder(test.pool.clone())
        .threads_per_destination(4)
        .destination_handler(
            DestinationHandler::builder(unique_destination())
                .with_pre_start_hook(hook.clone())
                .with_pre_start_hook(hook.clone())
                .raw_handler(RecordingHandler::succeeding()),
        )
        .build();

    // Act
    consumers.start().await.unwrap();
    let workers = consumers.worker_statuses().await.len();
    consumers.stop().await;

    // Assert
    assert_eq!(2, hook.count());
    assert_eq!(4, workers);
}

#[tokio::test]
async fn if_a_pre_start_hook_returns_an_error_the_pool_fails_to_start() {
    struct FailingHook;

    #[async_trait::async_trait]
    impl ConsumerPreStartHook for FailingHook {
        async fn run(&self, _session: &dyn Session, _destination: &Destination) -> Result<(), anyhow::Error> {
            Err(anyhow::anyhow!("Kaboom."))
        }
    }

    // Arrange
    let test = get_test_broker(2).await;
    let consumers = ConsumerPool::builder(test.pool.clone())
        // The first destination starts fine, the second one does not.
        .destination_handler(
            DestinationHandler::builder(unique_destination())
                .raw_handler(RecordingHandler::succeeding()),
        )
        .destination_handler(
            DestinationHandler::builder(unique_destination())
                .with_pre_start_hook(FailingHook)
                .raw_handler(RecordingHandler::succeeding()),
        )
        .build();

    // Act
    let outcome = consumers.start().await;

    // Assert
    assert!(matches!(outcome, Err(ConsumerError::PreStartHook { .. })));
    assert!(!consumers.is_running().await);
    assert_eq!(test.broker.open_sessions(), 0);
}

#[tokio::test]
async fn destination_prefixes_apply_to_consumed_destinations() {
    // Arrange
    let test = get_test_broker(2).await;
    let hook = CountingHook::default();
    let handler = RecordingHandler::succeeding();
    let consumers = ConsumerPool::builder(test.pool.clone())
        .destination_prefix("staging")
        .receive_timeout(Duration::from_millis(50))
        .with_pre_start_hook(hook.clone())
        .destination_handler(DestinationHandler::builder("orders").raw_handler(handler.clone()))
        .build();
    test.broker.enqueue("orders", Message::new("unprefixed"));
    test.broker.enqueue("staging_orders", Message::new("prefixed"));

    // Act
    consumers.start().await.unwrap();
    assert!(eventually(|| handler.count() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    consumers.stop().await;

    // Assert
    assert_eq!(handler.deliveries.lock().unwrap()[0].0, "prefixed");
    assert_eq!(hook.destinations.lock().unwrap().as_slice(), ["staging_orders"]);
    assert_eq!(test.broker.queue_depth("orders"), 1);
}

#[tokio::test]
async fn declare_hooks_create_the_destinations() {
    // Arrange
    let test = get_test_broker(2).await;
    let consumed = unique_destination();
    let forwarded = unique_destination();
    let consumers = ConsumerPool::builder(test.pool.clone())
        .destination_handler(
            DestinationHandler::builder(&consumed)
                .with_pre_start_hook(DeclareDestination)
                .with_pre_start_hook(DeclareDestinations(vec![forwarded.clone()]))
                .raw_handler(RecordingHandler::succeeding()),
        )
        .build();

    // Act
    consumers.start().await.unwrap();
    consumers.stop().await;

    // Assert
    assert!(test.broker.destination_exists(&consumed));
    assert!(test.broker.destination_exists(&forwarded));
}
