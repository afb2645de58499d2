use crate::amqp::configuration::UnexpectedErrorPolicy;
use crate::amqp::types::FieldTable;
use lapin::BasicProperties;
use tracing::warn;

use super::ProcessingResult;

/// Why a [`Consumer`] could not process a message.
#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    /// The message is well-formed but its content is not acceptable.
    ///
    /// Retrying cannot help: the message is acknowledged and dropped.
    #[error("The message failed validation")]
    Validation(#[source] anyhow::Error),
    /// Anything else. The [`UnexpectedErrorPolicy`] decides what happens to the message.
    #[error("The message could not be processed")]
    Unexpected(#[source] anyhow::Error),
}

/// Business logic for messages with a JSON body.
///
/// Implementers provide [`process`](Consumer::process); [`handle`](Consumer::handle) takes
/// care of decoding the message and of mapping failures to a [`ProcessingResult`]:
///
/// - a body that is not valid JSON is dropped,
/// - a [`ConsumerError::Validation`] is acknowledged,
/// - a [`ConsumerError::Unexpected`] follows the [`UnexpectedErrorPolicy`] it is given,
///   usually [`ConsumerSettings::unexpected`](crate::amqp::configuration::ConsumerSettings)
///   through a [`QueueConsumer`](super::QueueConsumer).
#[async_trait::async_trait]
pub trait Consumer: Send + Sync {
    async fn process(
        &self,
        payload: serde_json::Value,
        headers: &FieldTable,
    ) -> Result<ProcessingResult, ConsumerError>;

    async fn handle(
        &self,
        data: &[u8],
        properties: &BasicProperties,
        unexpected: UnexpectedErrorPolicy,
    ) -> ProcessingResult {
        let payload = match serde_json::from_slice(data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Dropping a message whose body is not valid JSON");
                return ProcessingResult::NackDrop;
            }
        };
        let headers = properties.headers().clone().unwrap_or_default();

        match self.process(payload, &headers).await {
            Ok(result) => result,
            Err(ConsumerError::Validation(e)) => {
                warn!(error = ?e, "Acknowledging a message that failed validation");
                ProcessingResult::Ack
            }
            Err(ConsumerError::Unexpected(e)) => {
                let result = ProcessingResult::from(unexpected);
                warn!(error = ?e, ?result, "Unexpected failure while processing a message");
                result
            }
        }
    }
}
