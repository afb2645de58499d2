use crate::amqp::convenience::{merge_headers, string_value};
use crate::amqp::types::FieldTable;
use crate::amqp::{BasicProperties, OutgoingMessage};
use crate::system::{Clock, SystemClock};
use crate::Error;
use chrono::SecondsFormat;
use std::sync::Arc;
use uuid::Uuid;

use super::ProducerPayload;

/// AMQP delivery mode asking the broker to persist the message to disk.
const PERSISTENT: u8 = 2;

/// Turns payloads into [`OutgoingMessage`]s.
///
/// Every message gets a JSON body and the `source`, `request_id`, `datetime` and `env`
/// headers. Caller-supplied headers are merged on top and win on conflicts.
#[derive(Clone)]
pub struct MessageFactory {
    clock: Arc<dyn Clock>,
    app_name: String,
    environment: String,
}

impl MessageFactory {
    pub fn new(app_name: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            app_name: app_name.into(),
            environment: environment.into(),
        }
    }

    /// Stamp messages using `clock` instead of the wall clock.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn make<P>(
        &self,
        payload: &P,
        headers: Option<&FieldTable>,
    ) -> Result<OutgoingMessage, Error>
    where
        P: ProducerPayload + ?Sized,
    {
        let body = payload.to_json().map_err(Error::Serialization)?;

        let request_id = Uuid::new_v4().to_string();
        let now = self.clock.now();
        let mut base = FieldTable::default();
        base.insert("source".into(), string_value(self.app_name.as_str()));
        base.insert("request_id".into(), string_value(request_id.as_str()));
        base.insert(
            "datetime".into(),
            string_value(now.to_rfc3339_opts(SecondsFormat::Secs, false)),
        );
        base.insert("env".into(), string_value(self.environment.as_str()));

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT)
            .with_message_id(request_id.into())
            .with_timestamp(now.timestamp().max(0) as u64)
            .with_headers(merge_headers(base, headers));

        Ok(OutgoingMessage { body, properties })
    }
}
