//! `carrot-relay` is a reliability layer for publishing to RabbitMQ, built on top of [`lapin`].
//!
//! It manages named broker connections (each with an optional reusable channel), publishes
//! messages with publisher confirms, and retries transient failures with bounded exponential
//! backoff while counting attempts, retries, failures and connection resets.
//!
//! [`Publisher`](crate::publishers::Publisher) and
//! [`ConnectionManager`](crate::pool::ConnectionManager) are the best starting points to
//! learn more about what `carrot-relay` provides and how to leverage it.

pub mod amqp;
pub mod consumers;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod publishers;
pub mod stats;
pub mod system;

mod error;

pub use error::{is_transient, Decider, Error};
