use crate::amqp::configuration::ConsumerSettings;
use crate::Error;
use lapin::{message::Delivery, options::BasicQosOptions, BasicProperties, Channel};

use super::{Consumer, ProcessingResult};

/// A [`Consumer`] bound to the consumer section of the configuration.
///
/// The application owns the queue subscription; it calls [`QueueConsumer::prepare`] on the
/// consuming channel and [`QueueConsumer::deliver`] for every delivery it receives.
pub struct QueueConsumer<C> {
    consumer: C,
    settings: ConsumerSettings,
}

impl<C: Consumer> QueueConsumer<C> {
    pub fn new(consumer: C, settings: &ConsumerSettings) -> Self {
        Self {
            consumer,
            settings: settings.clone(),
        }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Limit the number of unacknowledged deliveries on `channel` to the configured prefetch.
    pub async fn prepare(&self, channel: &Channel) -> Result<(), Error> {
        channel
            .basic_qos(self.settings.prefetch, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    /// Decode and process a message body, applying the configured unexpected-error policy.
    pub async fn handle(&self, data: &[u8], properties: &BasicProperties) -> ProcessingResult {
        self.consumer
            .handle(data, properties, self.settings.unexpected)
            .await
    }

    /// Process `delivery` and acknowledge it according to the outcome.
    #[tracing::instrument(
        skip_all,
        name = "rabbitmq_consume",
        fields(routing_key = %delivery.routing_key)
    )]
    pub async fn deliver(&self, delivery: &Delivery) -> Result<ProcessingResult, Error> {
        let result = self.handle(&delivery.data, &delivery.properties).await;
        result.apply(&delivery.acker).await?;
        Ok(result)
    }
}
