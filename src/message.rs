//! The messages that flow through the pools: what producers send and what consumers receive.
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Name of the property carrying how many times a message has been delivered, starting at 1.
///
/// It is set by the transport on every [`Incoming`] message.
pub const DELIVERY_COUNT: &str = "delivery-count";

/// A typed message property value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{b}"),
            PropertyValue::Int(i) => write!(f, "{i}"),
            PropertyValue::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(value.into())
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        PropertyValue::Int(value.into())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_owned())
    }
}

/// The name of a queue on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination(String);

impl Destination {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Destination {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl From<String> for Destination {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Links a reply to the request it answers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// A fresh, random correlation id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// A fresh correlation id starting with `prefix`.
    ///
    /// Used to route replies on a shared reply destination.
    pub fn random_with_prefix(prefix: &str) -> Self {
        Self(format!("{prefix}{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// How a message left the producer side. Recorded on spans and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    Sync,
    Async,
    Transactional,
    Request,
    Reply,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryMode::Sync => "sync",
            DeliveryMode::Async => "async",
            DeliveryMode::Transactional => "transactional",
            DeliveryMode::Request => "request",
            DeliveryMode::Reply => "reply",
        };
        f.write_str(s)
    }
}

/// An outgoing message: a payload plus its properties.
///
/// `Message` provides a fluent API to set the optional fields.
///
/// ```rust
/// use carrot_courier::message::Message;
///
/// let message = Message::new("ping")
///     .with_property("tenant", "acme")
///     .with_property("attempt", 1);
/// assert_eq!(message.payload_str(), "ping");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub properties: BTreeMap<String, PropertyValue>,
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<Destination>,
    /// Set by the producer pool if left empty.
    pub message_id: Option<String>,
    /// Unix time, in seconds. Set by the producer pool if left empty.
    pub timestamp: Option<u64>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<Destination>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// The payload as text. Invalid UTF-8 sequences are replaced.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A message received from a destination.
///
/// Its content is read-only: replies and forwards are built as new [`Message`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    destination: Destination,
    message: Message,
    delivery_tag: u64,
    delivery_count: u32,
}

impl Incoming {
    /// Called by broker transports when handing a message over to a consumer.
    ///
    /// `delivery_tag` identifies the delivery within the session that received it,
    /// `delivery_count` starts at 1 for the first delivery.
    pub fn new(
        destination: Destination,
        mut message: Message,
        delivery_tag: u64,
        delivery_count: u32,
    ) -> Self {
        let delivery_count = delivery_count.max(1);
        message
            .properties
            .insert(DELIVERY_COUNT.to_owned(), delivery_count.into());
        Self {
            destination,
            message,
            delivery_tag,
            delivery_count,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub fn payload_str(&self) -> Cow<'_, str> {
        self.message.payload_str()
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.message.property(name)
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.message.correlation_id.as_ref()
    }

    pub fn reply_to(&self) -> Option<&Destination> {
        self.message.reply_to.as_ref()
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// `true` if the message was handed to a consumer before.
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}
