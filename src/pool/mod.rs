//! Named broker connections, each with an optional reusable channel.
//!
//! [`ConnectionManager`] provides three guarantees:
//! - Every unit of work runs on a live connection: stale connections are replaced on demand.
//! - When channel reuse is enabled, a single channel per connection serves at most
//!   `max_channel_uses` units of work before it is recycled; closed channels are never reused.
//! - Connections and channels opened before a fork are never used by the child process.
//!
//! ```rust,no_run
//! use carrot_relay::amqp::configuration::AmqpSettings;
//! use carrot_relay::amqp::ConnectionFactory;
//! use carrot_relay::pool::ConnectionManager;
//!
//! async fn example() -> Result<(), carrot_relay::Error> {
//!     let manager = ConnectionManager::new(ConnectionFactory::new(), AmqpSettings::default());
//!
//!     let is_open = manager
//!         .with_channel("default", |channel| async move { Ok(channel.is_open()) })
//!         .await?;
//!     assert!(is_open);
//!     Ok(())
//! }
//! ```

mod channel;
mod connection;

pub use connection::ConnectionManager;
