use crate::helpers::{get_test_broker, unique_destination};
use carrot_courier::message::Message;
use carrot_courier::publishers::ProducerError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

#[tokio::test]
async fn sync_sends_are_visible_once_confirmed() {
    // Arrange
    let test = get_test_broker(2).await;
    let destination = unique_destination();

    // Act
    test.producers
        .send_sync(&destination, Message::new("hello").with_property("tenant", "acme"))
        .await
        .unwrap();

    // Assert
    assert_eq!(test.broker.queue_depth(&destination), 1);
    assert_eq!(test.pool.status().available, 1);
}

#[tokio::test]
async fn refused_sync_sends_keep_the_session_in_the_pool() {
    // Arrange
    let test = get_test_broker(1).await;
    let destination = unique_destination();
    test.broker.reject_sends_when(|_, message| message.payload_str() == "poison");

    // Act
    let refused = test
        .producers
        .send_sync(&destination, Message::new("poison"))
        .await;
    let accepted = test
        .producers
        .send_sync(&destination, Message::new("fine"))
        .await;

    // Assert
    assert!(matches!(refused, Err(ProducerError::SendRejected(_))));
    assert!(accepted.is_ok());
    assert_eq!(test.broker.queue_depth(&destination), 1);
    assert_eq!(test.broker.open_sessions(), 1);
}

#[tokio::test]
async fn async_sends_report_their_outcome_exactly_once() {
    // Arrange
    let test = get_test_broker(2).await;
    let destination = unique_destination();
    test.broker.reject_sends_when(|_, message| message.payload_str() == "refused");
    let calls = Arc::new(AtomicUsize::new(0));
    let (sender, receiver) = oneshot::channel();

    // Act
    let confirmation = test
        .producers
        .send_async(&destination, Message::new("refused"))
        .await
        .unwrap();
    let counter = Arc::clone(&calls);
    confirmation.on_complete(move |outcome| {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = sender.send(outcome);
    });
    let accepted = test
        .producers
        .send_async(&destination, Message::new("accepted"))
        .await
        .unwrap();

    // Assert
    let refused = tokio::time::timeout(Duration::from_secs(1), receiver)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(refused, Err(ProducerError::SendRejected(_))));
    assert!(accepted.await.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(test.broker.queue_depth(&destination), 1);
}

#[tokio::test]
async fn transactional_batches_are_all_or_nothing() {
    // Arrange
    let test = get_test_broker(2).await;
    let destination = unique_destination();
    test.broker.reject_sends_when(|_, message| message.payload_str() == "3");
    let batch = |size: usize| -> Vec<Message> {
        (1..=size).map(|i| Message::new(i.to_string())).collect()
    };

    // Act
    let failed = test
        .producers
        .send_transactional(&destination, batch(5))
        .await;
    test.broker.accept_all_sends();
    let committed = test
        .producers
        .send_transactional(&destination, batch(5))
        .await;

    // Assert
    assert!(matches!(failed, Err(ProducerError::SendRejected(_))));
    assert!(committed.is_ok());
    assert_eq!(test.broker.queue_depth(&destination), 5);
}

#[tokio::test]
async fn a_refused_last_message_discards_the_whole_batch() {
    // Arrange
    let test = get_test_broker(2).await;
    let destination = unique_destination();
    test.broker.reject_sends_when(|_, message| message.payload_str() == "last");
    let batch = vec![
        Message::new("first"),
        Message::new("second"),
        Message::new("last"),
    ];

    // Act
    let outcome = test.producers.send_transactional(&destination, batch).await;

    // Assert
    assert!(matches!(outcome, Err(ProducerError::SendRejected(_))));
    assert_eq!(test.broker.queue_depth(&destination), 0);
}

#[tokio::test]
async fn failed_commits_leave_nothing_behind() {
    // Arrange
    let test = get_test_broker(2).await;
    let destination = unique_destination();
    test.broker.fail_commits(true);

    // Act
    let outcome = test
        .producers
        .send_transactional(&destination, vec![Message::new("a"), Message::new("b")])
        .await;

    // Assert
    assert!(matches!(outcome, Err(ProducerError::CommitFailed(_))));
    assert_eq!(test.broker.queue_depth(&destination), 0);
}

#[tokio::test]
async fn a_failed_rollback_discards_the_session() {
    // Arrange
    let test = get_test_broker(2).await;
    let destination = unique_destination();
    test.broker.fail_commits(true);
    test.broker.fail_rollbacks(true);

    // Act
    let outcome = test
        .producers
        .send_transactional(&destination, vec![Message::new("a")])
        .await;

    // Assert
    match outcome {
        Err(ProducerError::RollbackFailed { cause, .. }) => {
            assert!(matches!(*cause, ProducerError::CommitFailed(_)));
        }
        other => panic!("Expected a rollback failure, got {other:?}"),
    }
    assert_eq!(test.broker.queue_depth(&destination), 0);
    assert_eq!(test.pool.transacted_status().size, 0);
    assert_eq!(test.broker.open_sessions(), 0);
}
