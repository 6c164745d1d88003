use crate::helpers::{eventually, get_test_broker, unique_destination, TestBroker};
use carrot_courier::consumers::{ConsumerPool, DestinationHandler, HandlerError};
use carrot_courier::message::{Incoming, Message};
use carrot_courier::request_reply::{
    Replier, ReplyStrategy, ReplyingHandler, RequestError, RequestReplyCoordinator,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn pong(request: &Incoming) -> Result<Message, HandlerError> {
    Ok(Message::new(format!("pong:{}", request.payload_str())))
}

/// Start a consumer answering every request on `destination`.
async fn start_echo_replier(test: &TestBroker, destination: &str) -> ConsumerPool {
    let replier = Replier::new(test.producers.clone());
    let consumers = ConsumerPool::builder(test.pool.clone())
        .receive_timeout(Duration::from_millis(50))
        .destination_handler(
            DestinationHandler::builder(destination).raw_handler(ReplyingHandler::new(replier, pong)),
        )
        .build();
    consumers.start().await.unwrap();
    consumers
}

#[tokio::test]
async fn requests_get_the_reply_of_the_replier() {
    // Arrange
    let test = get_test_broker(4).await;
    let destination = unique_destination();
    let replier = start_echo_replier(&test, &destination).await;
    let coordinator = RequestReplyCoordinator::builder(test.producers.clone())
        .start()
        .await
        .unwrap();

    // Act
    let reply = coordinator
        .request_sync(&destination, Message::new("ping"), Duration::from_secs(1))
        .await
        .unwrap();

    // Assert
    assert_eq!(reply.payload_str(), "pong:ping");
    assert_eq!(coordinator.pending_requests(), 0);
    replier.stop().await;
    coordinator.shutdown().await;
    assert!(!test
        .broker
        .destination_exists(coordinator.reply_destination().as_str()));
}

#[tokio::test]
async fn coordinators_sharing_a_reply_destination_only_see_their_own_replies() {
    // Arrange
    let test = get_test_broker(4).await;
    let destination = unique_destination();
    let shared = unique_destination();
    let replier = start_echo_replier(&test, &destination).await;
    let strategy = ReplyStrategy::Shared {
        destination: shared.clone(),
    };
    let first = RequestReplyCoordinator::builder(test.producers.clone())
        .reply_strategy(strategy.clone())
        .start()
        .await
        .unwrap();
    let second = RequestReplyCoordinator::builder(test.producers.clone())
        .reply_strategy(strategy)
        .start()
        .await
        .unwrap();

    // Act
    let timeout = Duration::from_secs(2);
    let (a, b) = tokio::join!(
        first.request_sync(&destination, Message::new("first"), timeout),
        second.request_sync(&destination, Message::new("second"), timeout),
    );

    // Assert
    assert_eq!(a.unwrap().payload_str(), "pong:first");
    assert_eq!(b.unwrap().payload_str(), "pong:second");
    assert_eq!(first.reply_destination().as_str(), shared);
    replier.stop().await;
    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn requests_without_a_replier_time_out() {
    // Arrange
    let test = get_test_broker(2).await;
    let coordinator = RequestReplyCoordinator::builder(test.producers.clone())
        .start()
        .await
        .unwrap();
    let started = Instant::now();

    // Act
    let outcome = coordinator
        .request_sync(&unique_destination(), Message::new("ping"), Duration::from_millis(200))
        .await;

    // Assert
    assert!(matches!(outcome, Err(RequestError::ReplyTimeout(_))));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(700), "timed out after {elapsed:?}");
    assert_eq!(coordinator.pending_requests(), 0);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn late_replies_are_dropped() {
    // Arrange
    let test = get_test_broker(4).await;
    let destination = unique_destination();
    let replier = Replier::new(test.producers.clone());
    let slow = ConsumerPool::builder(test.pool.clone())
        .receive_timeout(Duration::from_millis(50))
        .destination_handler(DestinationHandler::builder(&destination).raw_handler(SlowEcho(replier)))
        .build();
    slow.start().await.unwrap();
    let coordinator = RequestReplyCoordinator::builder(test.producers.clone())
        .start()
        .await
        .unwrap();

    // Act
    let outcome = coordinator
        .request_sync(&destination, Message::new("ping"), Duration::from_millis(100))
        .await;

    // Assert
    assert!(matches!(outcome, Err(RequestError::ReplyTimeout(_))));
    let broker = test.broker.clone();
    let reply_to = coordinator.reply_destination().clone();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(eventually(|| broker.queue_depth(reply_to.as_str()) == 0).await);
    assert_eq!(coordinator.pending_requests(), 0);
    slow.stop().await;
    coordinator.shutdown().await;
}

struct SlowEcho(Replier);

#[async_trait::async_trait]
impl carrot_courier::consumers::Handler for SlowEcho {
    async fn handle(&self, incoming: &Incoming) -> Result<(), HandlerError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.0
            .reply(incoming, Message::new("too late"))
            .await
            .map_err(HandlerError::transient)?;
        Ok(())
    }
}

#[tokio::test]
async fn unmatched_replies_resolve_nothing() {
    // Arrange
    let test = get_test_broker(4).await;
    let destination = unique_destination();
    let replier = start_echo_replier(&test, &destination).await;
    let coordinator = RequestReplyCoordinator::builder(test.producers.clone())
        .start()
        .await
        .unwrap();

    // Act
    test.broker.enqueue(
        coordinator.reply_destination().as_str(),
        Message::new("stray").with_correlation_id("nobody-asked"),
    );
    let reply = coordinator
        .request_sync(&destination, Message::new("ping"), Duration::from_secs(1))
        .await
        .unwrap();

    // Assert
    assert_eq!(reply.payload_str(), "pong:ping");
    replier.stop().await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn async_request_callbacks_run_exactly_once() {
    // Arrange
    let test = get_test_broker(4).await;
    let destination = unique_destination();
    let replier = start_echo_replier(&test, &destination).await;
    let coordinator = RequestReplyCoordinator::builder(test.producers.clone())
        .start()
        .await
        .unwrap();
    let (sender, mut receiver) = mpsc::unbounded_channel();

    // Act
    let answered = sender.clone();
    coordinator
        .request_async(
            &destination,
            Message::new("ping"),
            Duration::from_secs(1),
            move |outcome| {
                let _ = answered.send(outcome.map(|reply| reply.payload_str().into_owned()));
            },
        )
        .await
        .unwrap();
    let unanswered = sender;
    coordinator
        .request_async(
            &unique_destination(),
            Message::new("ping"),
            Duration::from_millis(100),
            move |outcome| {
                let _ = unanswered.send(outcome.map(|reply| reply.payload_str().into_owned()));
            },
        )
        .await
        .unwrap();

    // Assert
    let mut outcomes = Vec::new();
    while let Some(outcome) = receiver.recv().await {
        outcomes.push(outcome);
    }
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes
        .iter()
        .any(|outcome| matches!(outcome, Ok(payload) if payload == "pong:ping")));
    assert!(outcomes
        .iter()
        .any(|outcome| matches!(outcome, Err(RequestError::ReplyTimeout(_)))));
    assert_eq!(coordinator.pending_requests(), 0);
    replier.stop().await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn shutdown_fails_pending_requests_and_releases_every_session() {
    // Arrange
    let test = get_test_broker(2).await;
    let coordinator = RequestReplyCoordinator::builder(test.producers.clone())
        .start()
        .await
        .unwrap();
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&outcomes);
    coordinator
        .request_async(
            &unique_destination(),
            Message::new("ping"),
            Duration::from_secs(30),
            move |outcome| recorded.lock().unwrap().push(outcome.is_ok()),
        )
        .await
        .unwrap();
    let waiting = coordinator.clone();
    let blocked = tokio::spawn(async move {
        waiting
            .request_sync(&unique_destination(), Message::new("ping"), Duration::from_secs(30))
            .await
    });
    let pending = coordinator.clone();
    assert!(eventually(|| pending.pending_requests() == 2).await);

    // Act
    coordinator.shutdown().await;

    // Assert
    assert!(matches!(blocked.await.unwrap(), Err(RequestError::Shutdown)));
    assert_eq!(outcomes.lock().unwrap().as_slice(), [false]);
    assert!(matches!(
        coordinator
            .request_sync(&unique_destination(), Message::new("ping"), Duration::from_secs(1))
            .await,
        Err(RequestError::Shutdown)
    ));
    test.pool.shutdown().await;
    assert_eq!(test.broker.open_sessions(), 0);
}

#[tokio::test]
async fn replies_to_requests_without_reply_destination_are_dropped() {
    // Arrange
    let test = get_test_broker(2).await;
    let replier = Replier::new(test.producers.clone());
    let request = Incoming::new("requests".into(), Message::new("ping"), 1, 1);

    // Act
    let sent = replier.reply(&request, Message::new("pong")).await.unwrap();

    // Assert
    assert!(!sent);
}

#[tokio::test]
async fn replies_fall_back_to_the_request_message_id() {
    // Arrange
    let test = get_test_broker(2).await;
    let replier = Replier::new(test.producers.clone());
    let reply_to = unique_destination();
    let request = Incoming::new(
        "requests".into(),
        Message::new("ping")
            .with_message_id("request-1")
            .with_reply_to(reply_to.as_str()),
        1,
        1,
    );

    // Act
    let sent = replier.reply(&request, Message::new("pong")).await.unwrap();

    // Assert
    assert!(sent);
    let session = test.pool.acquire(Duration::from_millis(100)).await.unwrap();
    let mut consumer = session
        .create_consumer(&reply_to.as_str().into(), None)
        .await
        .unwrap();
    let reply = consumer.receive(Duration::from_millis(100)).await.unwrap().unwrap();
    assert_eq!(reply.correlation_id().map(|id| id.as_str()), Some("request-1"));
}

#[tokio::test]
async fn a_panicking_callback_does_not_stop_the_coordinator() {
    // Arrange
    let test = get_test_broker(4).await;
    let destination = unique_destination();
    let replier = start_echo_replier(&test, &destination).await;
    let coordinator = RequestReplyCoordinator::builder(test.producers.clone())
        .start()
        .await
        .unwrap();
    coordinator
        .request_async(
            &destination,
            Message::new("boom"),
            Duration::from_secs(1),
            |_| panic!("the callback failed"),
        )
        .await
        .unwrap();
    let pending = coordinator.clone();
    assert!(eventually(|| pending.pending_requests() == 0).await);

    // Act
    let reply = coordinator
        .request_sync(&destination, Message::new("ping"), Duration::from_secs(1))
        .await;

    // Assert
    assert_eq!(reply.unwrap().payload_str(), "pong:ping");
    replier.stop().await;
    coordinator.shutdown().await;
}
