use crate::amqp::configuration::DEFAULT_CONNECTION;
use serde::Serialize;

/// A message body that knows where it has to be published.
///
/// Each payload names the connection, the exchange and the routing key it targets: a single
/// batch can therefore fan out to several brokers.
pub trait ProducerPayload: Send + Sync {
    /// The named connection to publish on.
    fn connection_name(&self) -> &str {
        DEFAULT_CONNECTION
    }

    /// The exchange to publish to. `None` targets the default exchange.
    fn exchange_name(&self) -> Option<&str> {
        None
    }

    /// `None` is published with an empty routing key.
    fn routing_key(&self) -> Option<&str> {
        None
    }

    /// Encode the body of the message.
    fn to_json(&self) -> Result<Vec<u8>, serde_json::Error>;
}

impl<T: ProducerPayload + ?Sized> ProducerPayload for &T {
    fn connection_name(&self) -> &str {
        (**self).connection_name()
    }

    fn exchange_name(&self) -> Option<&str> {
        (**self).exchange_name()
    }

    fn routing_key(&self) -> Option<&str> {
        (**self).routing_key()
    }

    fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        (**self).to_json()
    }
}

impl<T: ProducerPayload + ?Sized> ProducerPayload for Box<T> {
    fn connection_name(&self) -> &str {
        (**self).connection_name()
    }

    fn exchange_name(&self) -> Option<&str> {
        (**self).exchange_name()
    }

    fn routing_key(&self) -> Option<&str> {
        (**self).routing_key()
    }

    fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        (**self).to_json()
    }
}

/// Any serializable value, together with its destination.
///
/// ```rust
/// use carrot_relay::publishers::{Payload, ProducerPayload};
///
/// let payload = Payload::new(serde_json::json!({ "member_id": 42 }))
///     .with_connection("members")
///     .with_exchange("member.ex")
///     .with_routing_key("member.created");
///
/// assert_eq!("members", payload.connection_name());
/// assert_eq!(br#"{"member_id":42}"#.to_vec(), payload.to_json().unwrap());
/// ```
#[derive(Debug, Clone)]
pub struct Payload<T> {
    data: T,
    connection: String,
    exchange: Option<String>,
    routing_key: Option<String>,
}

impl<T> Payload<T> {
    /// Target the default exchange of the `default` connection.
    pub fn new(data: T) -> Self {
        Self {
            data,
            connection: DEFAULT_CONNECTION.to_owned(),
            exchange: None,
            routing_key: None,
        }
    }

    #[must_use]
    pub fn with_connection(mut self, name: impl Into<String>) -> Self {
        self.connection = name.into();
        self
    }

    #[must_use]
    pub fn with_exchange(mut self, name: impl Into<String>) -> Self {
        self.exchange = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }
}

impl<T: Serialize + Send + Sync> ProducerPayload for Payload<T> {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    fn exchange_name(&self) -> Option<&str> {
        self.exchange.as_deref()
    }

    fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.data)
    }
}
