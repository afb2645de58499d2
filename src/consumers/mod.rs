//! The outcome taxonomy of message consumption.
//!
//! A [`Consumer`] turns a delivery into a [`ProcessingResult`]: acknowledge it, put it back
//! on the queue, or drop it (letting the broker dead-letter it if a dead-letter exchange is
//! configured). A [`QueueConsumer`] applies the consumer section of the configuration
//! (prefetch and unexpected-error policy); subscribing to queues is left to the application.
mod consumer;
mod outcome;
mod queue;

pub use consumer::{Consumer, ConsumerError};
pub use outcome::ProcessingResult;
pub use queue::QueueConsumer;
