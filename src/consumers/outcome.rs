use crate::amqp::configuration::UnexpectedErrorPolicy;
use crate::Error;
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicNackOptions},
};
use serde::{Deserialize, Serialize};

/// What the broker is told once a message has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingResult {
    /// Positive acknowledgement - the message can be removed from the queue.
    Ack,
    /// Negative acknowledgement - the message is re-delivered to the queue.
    NackRequeue,
    /// Negative acknowledgement without requeueing - the message is dead-lettered or discarded.
    NackDrop,
}

impl From<UnexpectedErrorPolicy> for ProcessingResult {
    fn from(policy: UnexpectedErrorPolicy) -> Self {
        match policy {
            UnexpectedErrorPolicy::Requeue => ProcessingResult::NackRequeue,
            UnexpectedErrorPolicy::Drop => ProcessingResult::NackDrop,
        }
    }
}

impl ProcessingResult {
    /// Send the acknowledgement matching this outcome to the broker.
    pub async fn apply(self, acker: &Acker) -> Result<(), Error> {
        match self {
            ProcessingResult::Ack => acker.ack(BasicAckOptions { multiple: false }).await?,
            ProcessingResult::NackRequeue | ProcessingResult::NackDrop => {
                let nack_options = BasicNackOptions {
                    multiple: false,
                    requeue: self == ProcessingResult::NackRequeue,
                };
                acker.nack(nack_options).await?
            }
        }
        Ok(())
    }
}
