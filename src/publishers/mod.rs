//! Facilities to publish messages to RabbitMq with publisher confirms and retries.
//! Check out [`Publisher`] as a starting point.
mod message;
mod payload;
mod publisher;
mod retry;

pub use message::MessageFactory;
pub use payload::{Payload, ProducerPayload};
pub use publisher::{Publisher, PublisherBuilder, PublishOptions, DEFAULT_MAX_ATTEMPTS};
pub use retry::{thread_rng_source, Backoff, RandomSource, RetryPolicy};
