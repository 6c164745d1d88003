use crate::consumers::{Handler, HandlerError};
use crate::message::{DeliveryMode, Incoming, Message};
use crate::publishers::{ProducerError, ProducerPool};

/// Sends replies back to the requester, on the destination named by the request.
#[derive(Clone)]
pub struct Replier {
    producers: ProducerPool,
}

impl Replier {
    pub fn new(producers: ProducerPool) -> Self {
        Self { producers }
    }

    /// Send `reply` to the reply destination of `request`, tagged with the request's
    /// correlation id (or its message id, if the requester did not set one).
    ///
    /// Returns `Ok(false)` without sending anything if the request has no reply destination.
    #[tracing::instrument(
        name = "reply",
        skip_all,
        fields(mode = %DeliveryMode::Reply, correlation_id)
    )]
    pub async fn reply(&self, request: &Incoming, reply: Message) -> Result<bool, ProducerError> {
        let reply_to = match request.reply_to() {
            Some(reply_to) => reply_to.clone(),
            None => {
                tracing::warn!(
                    destination = %request.destination(),
                    "Request has no reply destination, dropping the reply"
                );
                return Ok(false);
            }
        };
        let correlation_id = request.correlation_id().cloned().or_else(|| {
            request
                .message()
                .message_id
                .as_deref()
                .map(Into::into)
        });
        let reply = match correlation_id {
            Some(correlation_id) => {
                tracing::Span::current().record("correlation_id", correlation_id.as_str());
                reply.with_correlation_id(correlation_id)
            }
            None => reply,
        };
        self.producers.send_sync(reply_to.as_str(), reply).await?;
        Ok(true)
    }
}

/// Computes the reply to a request.
///
/// Implemented for every `Fn(&Incoming) -> Result<Message, HandlerError>`.
#[async_trait::async_trait]
pub trait Responder: Send + Sync + 'static {
    async fn respond(&self, request: &Incoming) -> Result<Message, HandlerError>;
}

#[async_trait::async_trait]
impl<F> Responder for F
where
    F: Fn(&Incoming) -> Result<Message, HandlerError> + Send + Sync + 'static,
{
    async fn respond(&self, request: &Incoming) -> Result<Message, HandlerError> {
        (self)(request)
    }
}

/// A [`Handler`] answering every request it receives.
///
/// ```rust
/// use carrot_courier::consumers::{DestinationHandler, HandlerError};
/// use carrot_courier::message::{Incoming, Message};
/// use carrot_courier::publishers::ProducerPool;
/// use carrot_courier::request_reply::{Replier, ReplyingHandler};
///
/// fn pong(request: &Incoming) -> Result<Message, HandlerError> {
///     Ok(Message::new(format!("pong:{}", request.payload_str())))
/// }
///
/// fn echo(producers: ProducerPool) -> DestinationHandler {
///     let handler = ReplyingHandler::new(Replier::new(producers), pong);
///     DestinationHandler::builder("ping").raw_handler(handler)
/// }
/// ```
pub struct ReplyingHandler<R> {
    replier: Replier,
    responder: R,
}

impl<R: Responder> ReplyingHandler<R> {
    pub fn new(replier: Replier, responder: R) -> Self {
        Self { replier, responder }
    }
}

#[async_trait::async_trait]
impl<R: Responder> Handler for ReplyingHandler<R> {
    async fn handle(&self, incoming: &Incoming) -> Result<(), HandlerError> {
        let reply = self.responder.respond(incoming).await?;
        // The request stays unsettled until its reply is out.
        self.replier
            .reply(incoming, reply)
            .await
            .map_err(HandlerError::transient)?;
        Ok(())
    }
}
