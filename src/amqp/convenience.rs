//! Mapping between [`Message`]s and AMQP properties.
use crate::message::{Destination, Incoming, Message, PropertyValue};
use lapin::{message::Delivery, types::AMQPValue, types::FieldTable, BasicProperties};
use std::borrow::{Borrow, Cow};

/// Header set by RabbitMq quorum queues: how many times the message was returned.
pub const RABBITMQ_DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

/// Convenience methods for [`lapin::BasicProperties`].
pub trait BasicPropertiesExt {
    /// Lookup header by key.
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized;

    /// Lookup a header string value.
    ///
    /// Returns `None` if not a string.
    fn get_header_str<Q>(&self, key: &Q) -> Option<Cow<'_, str>>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        match self.get_header(key) {
            Some(AMQPValue::LongString(s)) => Some(String::from_utf8_lossy(s.as_bytes())),
            Some(AMQPValue::ShortString(s)) => Some(Cow::Borrowed(s.as_str())),
            _ => None,
        }
    }
}

impl BasicPropertiesExt for lapin::BasicProperties {
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        self.headers().as_ref()?.inner().get(key)
    }
}

/// Set the value for a header inside a collection of AMQP properties.
///
/// `lapin` does not give mutable access to headers: they are cloned and `properties` is
/// consumed, so the caller cannot re-use it believing it was mutated.
///
/// ```rust
/// use carrot_courier::amqp::types::{AMQPValue, ShortString};
/// use carrot_courier::amqp::{BasicProperties, convenience::set_header};
///
/// let properties = set_header(
///     BasicProperties::default(),
///     "tenant",
///     AMQPValue::LongString("acme".into()),
/// );
///
/// let headers = properties.headers().as_ref().unwrap().inner();
/// let header_name: ShortString = "tenant".into();
/// assert!(headers.contains_key(&header_name));
/// ```
pub fn set_header(
    properties: BasicProperties,
    header_name: &str,
    header_value: AMQPValue,
) -> BasicProperties {
    let mut headers = properties
        .headers()
        .as_ref()
        .map(|h| h.to_owned())
        .unwrap_or_default();
    headers.insert(header_name.into(), header_value);
    properties.with_headers(headers)
}

pub fn to_amqp_value(value: &PropertyValue) -> AMQPValue {
    match value {
        PropertyValue::Bool(b) => AMQPValue::Boolean(*b),
        PropertyValue::Int(i) => AMQPValue::LongLongInt(*i),
        PropertyValue::String(s) => AMQPValue::LongString(s.clone().into()),
    }
}

/// `None` for AMQP values that have no [`PropertyValue`] counterpart (tables, arrays, floats).
pub fn from_amqp_value(value: &AMQPValue) -> Option<PropertyValue> {
    let value = match value {
        AMQPValue::Boolean(b) => PropertyValue::Bool(*b),
        AMQPValue::ShortShortInt(i) => PropertyValue::Int((*i).into()),
        AMQPValue::ShortShortUInt(i) => PropertyValue::Int((*i).into()),
        AMQPValue::ShortInt(i) => PropertyValue::Int((*i).into()),
        AMQPValue::ShortUInt(i) => PropertyValue::Int((*i).into()),
        AMQPValue::LongInt(i) => PropertyValue::Int((*i).into()),
        AMQPValue::LongUInt(i) => PropertyValue::Int((*i).into()),
        AMQPValue::LongLongInt(i) => PropertyValue::Int(*i),
        AMQPValue::Timestamp(t) => PropertyValue::Int(i64::try_from(*t).ok()?),
        AMQPValue::ShortString(s) => PropertyValue::String(s.as_str().to_owned()),
        AMQPValue::LongString(s) => {
            PropertyValue::String(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        _ => return None,
    };
    Some(value)
}

/// The AMQP properties carrying a [`Message`]'s metadata. Messages are published as persistent.
pub fn to_basic_properties(message: &Message) -> BasicProperties {
    let mut properties = BasicProperties::default().with_delivery_mode(PERSISTENT);
    if !message.properties.is_empty() {
        let mut headers = FieldTable::default();
        for (name, value) in &message.properties {
            headers.insert(name.as_str().into(), to_amqp_value(value));
        }
        properties = properties.with_headers(headers);
    }
    if let Some(correlation_id) = &message.correlation_id {
        properties = properties.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(reply_to) = &message.reply_to {
        properties = properties.with_reply_to(reply_to.as_str().into());
    }
    if let Some(message_id) = &message.message_id {
        properties = properties.with_message_id(message_id.as_str().into());
    }
    if let Some(timestamp) = message.timestamp {
        properties = properties.with_timestamp(timestamp);
    }
    properties
}

pub fn to_message(payload: Vec<u8>, properties: &BasicProperties) -> Message {
    let mut message = Message::new(payload);
    if let Some(headers) = properties.headers() {
        message.properties = headers
            .inner()
            .iter()
            .filter_map(|(name, value)| {
                from_amqp_value(value).map(|value| (name.as_str().to_owned(), value))
            })
            .collect();
    }
    message.correlation_id = properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str().into());
    message.reply_to = properties
        .reply_to()
        .as_ref()
        .map(|reply_to| Destination::from(reply_to.as_str()));
    message.message_id = properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_owned());
    message.timestamp = *properties.timestamp();
    message
}

/// How many times a delivery has been handed to a consumer, the current one included.
///
/// AMQP 0.9.1 only flags redeliveries: the exact count is known on quorum queues, which keep
/// it in a header.
pub fn delivery_count(properties: &BasicProperties, redelivered: bool) -> u32 {
    let returned = properties
        .get_header(RABBITMQ_DELIVERY_COUNT_HEADER)
        .and_then(from_amqp_value)
        .and_then(|value| value.as_int())
        .and_then(|count| u32::try_from(count).ok());
    match returned {
        Some(count) => count.saturating_add(1),
        None if redelivered => 2,
        None => 1,
    }
}

pub fn to_incoming(destination: &Destination, delivery: Delivery) -> Incoming {
    let count = delivery_count(&delivery.properties, delivery.redelivered);
    let message = to_message(delivery.data, &delivery.properties);
    Incoming::new(destination.clone(), message, delivery.delivery_tag, count)
}
