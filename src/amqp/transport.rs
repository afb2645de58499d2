//! The seam between the connection manager and the AMQP client.
//!
//! [`Connector`], [`BrokerConnection`] and [`BrokerChannel`] describe the handful of
//! primitives the manager and the publisher rely on. The `lapin` implementations live here
//! and in [`ConnectionFactory`](crate::amqp::ConnectionFactory); tests can plug in their own.
use crate::amqp::configuration::ConnectionSettings;
use crate::Error;
use futures_util::future::try_join_all;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::{Confirmation, PublisherConfirm},
    BasicProperties, ChannelState,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tracing::{debug, warn};

/// A message ready to be handed to a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    /// The body of the message - as a sequence of bytes.
    pub body: Vec<u8>,
    /// Content type, delivery mode, headers, etc.
    pub properties: BasicProperties,
}

/// Creates connections to a broker from a named connection definition.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new connection.
    ///
    /// Fails with [`Error::Configuration`] if `settings` is missing required fields.
    async fn connect(
        &self,
        name: &str,
        settings: &ConnectionSettings,
    ) -> Result<Arc<dyn BrokerConnection>, Error>;
}

/// An open transport connection to a broker.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, Error>;

    async fn close(&self) -> Result<(), Error>;
}

/// A channel multiplexed over a [`BrokerConnection`].
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Put the channel in publisher confirms mode.
    async fn confirm_select(&self) -> Result<(), Error>;

    /// Publish `message` on `exchange`.
    ///
    /// The mandatory flag tells the broker how to react if the message cannot be routed to a queue.
    /// If this flag is `true`, the broker will return an unroutable message with a Return method.
    /// If this flag is `false`, the broker silently drops the message.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        message: &OutgoingMessage,
    ) -> Result<(), Error>;

    /// Wait for the broker to confirm everything published since the last wait.
    ///
    /// Returns `false` if the wait timed out, or if any message was nacked or returned.
    async fn wait_for_confirms(&self, timeout: Duration) -> Result<bool, Error>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), Error>;
}

#[async_trait::async_trait]
impl BrokerConnection for lapin::Connection {
    fn is_connected(&self) -> bool {
        self.status().connected()
    }

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, Error> {
        let channel = self.create_channel().await?;
        Ok(Arc::new(LapinChannel::new(channel)))
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(lapin::Connection::close(self, 200, "OK").await?)
    }
}

/// A [`lapin::Channel`] that keeps track of the publisher confirms it still owes.
pub struct LapinChannel {
    inner: lapin::Channel,
    confirms_enabled: AtomicBool,
    pending: PendingConfirms<PublisherConfirm>,
}

impl LapinChannel {
    pub fn new(inner: lapin::Channel) -> Self {
        Self {
            inner,
            confirms_enabled: AtomicBool::new(false),
            pending: PendingConfirms::default(),
        }
    }

    /// Get access to the underlying raw channel
    pub fn raw(&self) -> &lapin::Channel {
        &self.inner
    }
}

#[async_trait::async_trait]
impl BrokerChannel for LapinChannel {
    async fn confirm_select(&self) -> Result<(), Error> {
        // A new unit of work never waits on confirms left behind by an aborted one.
        let stale = self.pending.discard();
        if stale > 0 {
            debug!(stale, "Discarding publisher confirms of an earlier unit of work");
        }
        if self.confirms_enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        // See https://www.rabbitmq.com/amqp-0-9-1-reference.html#confirm.select.nowait
        self.inner
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await?;
        self.confirms_enabled.store(true, Ordering::Release);
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, message))]
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        message: &OutgoingMessage,
    ) -> Result<(), Error> {
        let options = BasicPublishOptions {
            mandatory,
            // The immediate flag was dropped in RabbitMQ 3.0 - see https://www.rabbitmq.com/blog/2012/11/19/breaking-things-with-rabbitmq-3-0/
            // Setting `true` will cause a not-supported error
            immediate: false,
        };
        let published = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                options,
                &message.body,
                message.properties.clone(),
            )
            .await;
        match published {
            Ok(confirm) => {
                self.pending.push(confirm);
                Ok(())
            }
            Err(e) => {
                self.pending.discard();
                Err(e.into())
            }
        }
    }

    async fn wait_for_confirms(&self, timeout: Duration) -> Result<bool, Error> {
        let pending = self.pending.take();
        let confirmations = match tokio::time::timeout(timeout, try_join_all(pending)).await {
            Ok(confirmations) => confirmations?,
            Err(_) => {
                warn!(?timeout, "Timed out waiting for publisher confirms");
                return Ok(false);
            }
        };

        let mut confirmed = true;
        for confirmation in confirmations {
            match confirmation {
                Confirmation::Ack(None) | Confirmation::NotRequested => {}
                Confirmation::Ack(Some(returned)) => {
                    warn!(
                        reply_code = returned.reply_code,
                        "The broker returned an unroutable message"
                    );
                    confirmed = false;
                }
                Confirmation::Nack(_) => {
                    warn!("The broker nacked a published message");
                    confirmed = false;
                }
            }
        }
        Ok(confirmed)
    }

    fn is_open(&self) -> bool {
        matches!(self.inner.status().state(), ChannelState::Connected)
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(self.inner.close(200, "OK").await?)
    }
}

/// The publisher confirms a channel owes for the current unit of work.
struct PendingConfirms<T>(Mutex<Vec<T>>);

impl<T> Default for PendingConfirms<T> {
    fn default() -> Self {
        Self(Mutex::new(Vec::new()))
    }
}

impl<T> PendingConfirms<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<T>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, confirm: T) {
        self.lock().push(confirm);
    }

    /// Hand over every pending confirm, leaving none behind.
    fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.lock())
    }

    /// Forget every pending confirm and return how many there were.
    fn discard(&self) -> usize {
        self.take().len()
    }
}
