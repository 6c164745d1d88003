use crate::helpers::{get_test_broker, unique_destination};
use carrot_courier::message::Message;
use carrot_courier::pool::PoolError;
use carrot_courier::publishers::ProducerError;
use std::time::Duration;

#[tokio::test]
async fn concurrent_senders_never_open_more_sessions_than_the_pool_allows() {
    // Arrange
    let test = get_test_broker(3).await;
    let destination = unique_destination();

    // Act
    let mut handles = Vec::new();
    for i in 0..20 {
        let producers = test.producers.clone();
        let destination = destination.clone();
        handles.push(tokio::spawn(async move {
            producers
                .send_sync(&destination, Message::new(format!("message-{i}")))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Assert
    assert_eq!(test.broker.queue_depth(&destination), 20);
    assert!(test.pool.status().size <= 3);
    assert!(test.broker.open_sessions() <= 3);
}

#[tokio::test]
async fn senders_fail_with_exhausted_when_no_session_frees_up_in_time() {
    // Arrange
    let test = get_test_broker(1).await;
    let _held = test.pool.acquire(Duration::from_millis(100)).await.unwrap();

    // Act
    let outcome = test
        .producers
        .send_sync(&unique_destination(), Message::new("payload"))
        .await;

    // Assert
    assert!(matches!(
        outcome,
        Err(ProducerError::Pool(PoolError::Exhausted(_)))
    ));
}

#[tokio::test]
async fn pool_sizes_must_be_positive() {
    let outcome = carrot_courier::pool::ConnectionPool::builder(
        carrot_courier::broker::memory::MemoryBroker::new(),
    )
    .max_size(0)
    .build()
    .await;

    assert!(matches!(outcome, Err(PoolError::InvalidConfiguration(_))));
}

#[tokio::test]
async fn sends_after_shutdown_are_refused() {
    // Arrange
    let test = get_test_broker(2).await;
    test.pool.shutdown().await;

    // Act
    let outcome = test
        .producers
        .send_sync(&unique_destination(), Message::new("payload"))
        .await;

    // Assert
    assert!(matches!(outcome, Err(ProducerError::Pool(PoolError::Closed))));
    assert_eq!(test.broker.open_sessions(), 0);
}

#[tokio::test]
async fn at_most_max_size_callers_hold_a_session_at_once() {
    // Arrange
    let test = get_test_broker(3).await;
    let mut holders = Vec::new();
    for _ in 0..3 {
        holders.push(test.pool.acquire(Duration::from_millis(100)).await.unwrap());
    }

    // Act
    let mut waiting = Vec::new();
    for _ in 0..2 {
        let pool = test.pool.clone();
        waiting.push(tokio::spawn(async move {
            pool.acquire(Duration::from_millis(50)).await.map(|s| s.release())
        }));
    }

    // Assert
    for handle in waiting {
        assert!(matches!(handle.await.unwrap(), Err(PoolError::Exhausted(_))));
    }
    assert_eq!(test.pool.status().size, 3);
    assert_eq!(test.broker.open_sessions(), 3);

    // A released session is handed to the next caller.
    holders.pop().unwrap().release();
    assert!(test.pool.acquire(Duration::from_millis(50)).await.is_ok());
}
