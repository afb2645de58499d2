use crate::amqp::types::FieldTable;
use crate::error::{is_transient, Decider};
use crate::pool::ConnectionManager;
use crate::stats::{Counter, Stats};
use crate::Error;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{error, info, warn};

use super::retry::{thread_rng_source, RandomSource, RetryPolicy};
use super::{MessageFactory, ProducerPayload};

/// How many times a publish is attempted when the caller does not say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A high-level interface to publish messages with publisher confirms.
///
/// # Fault tolerance
///
/// Every publish waits for the broker to confirm the message. Failures the active decider
/// deems transient are retried with exponential backoff: before each new attempt the
/// connection the failure happened on is reset, so the retry starts from a fresh connection
/// and channel. Delivery is at-least-once: a confirm lost after the broker accepted the
/// message leads to a duplicate.
///
/// # How do I build a `Publisher`?
///
/// `Publisher` provides a fluent API to add configuration step-by-step, known as
/// "builder pattern" in Rust.
/// The starting point is [`Publisher::builder`].
pub struct Publisher {
    manager: Arc<ConnectionManager>,
    messages: MessageFactory,
    stats: Stats,
    retry_policy: RetryPolicy,
    classifier: Decider,
    random: RandomSource,
    /// How long a single attempt waits for publisher confirms.
    confirm_timeout: Duration,
}

/// Per-call knobs for [`Publisher::publish_with`] and [`Publisher::batch_publish_with`].
#[derive(Clone, Default)]
pub struct PublishOptions {
    headers: Option<FieldTable>,
    max_attempts: Option<u32>,
    decider: Option<Decider>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers merged over the ones every message gets.
    #[must_use]
    pub fn headers(mut self, headers: FieldTable) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Total number of attempts, first one included. Values below 1 are treated as 1.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Decide which errors are retried, instead of the publisher's classifier.
    #[must_use]
    pub fn decider<D>(mut self, decider: D) -> Self
    where
        D: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.decider = Some(Arc::new(decider));
        self
    }
}

impl Publisher {
    /// Start building a [`Publisher`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use carrot_relay::amqp::configuration::AmqpSettings;
    /// use carrot_relay::amqp::ConnectionFactory;
    /// use carrot_relay::pool::ConnectionManager;
    /// use carrot_relay::publishers::{MessageFactory, Publisher};
    /// use carrot_relay::stats::Stats;
    /// use std::sync::Arc;
    ///
    /// pub fn get_publisher(stats: Stats) -> Publisher {
    ///     let manager = ConnectionManager::new(ConnectionFactory::new(), AmqpSettings::default());
    ///
    ///     Publisher::builder(Arc::new(manager), MessageFactory::new("billing", "production"))
    ///         .stats(stats)
    ///         .confirm_timeout(std::time::Duration::from_secs(3))
    ///         .build()
    /// }
    /// ```
    pub fn builder(manager: Arc<ConnectionManager>, messages: MessageFactory) -> PublisherBuilder {
        PublisherBuilder::new(manager, messages)
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Publish a single message with the default options.
    pub async fn publish<P>(&self, payload: &P) -> Result<(), Error>
    where
        P: ProducerPayload + ?Sized,
    {
        self.publish_with(payload, &PublishOptions::default()).await
    }

    /// Publish a single message to the connection, exchange and routing key it names.
    #[tracing::instrument(
        name = "rabbitmq_publish",
        skip_all,
        fields(connection = %payload.connection_name())
    )]
    pub async fn publish_with<P>(
        &self,
        payload: &P,
        options: &PublishOptions,
    ) -> Result<(), Error>
    where
        P: ProducerPayload + ?Sized,
    {
        let connection = payload.connection_name();
        let payloads = [payload];
        self.with_retries(connection, options, || {
            self.publish_group(connection, &payloads, options.headers.as_ref())
        })
        .await
    }

    /// Publish a batch of messages with the default options.
    pub async fn batch_publish<P>(&self, payloads: &[P]) -> Result<(), Error>
    where
        P: ProducerPayload,
    {
        self.batch_publish_with(payloads, &PublishOptions::default())
            .await
    }

    /// Publish a batch of messages, possibly spread over several connections.
    ///
    /// Payloads are grouped by connection, keeping their relative order. Each group goes out
    /// on a single channel and waits once for all its confirms; each group retries on its
    /// own, so a failure on one connection never resets another one.
    ///
    /// Groups are published in order of first appearance. The first group that fails for
    /// good aborts the batch: the following groups are not published.
    #[tracing::instrument(
        name = "rabbitmq_batch_publish",
        skip_all,
        fields(size = payloads.len())
    )]
    pub async fn batch_publish_with<P>(
        &self,
        payloads: &[P],
        options: &PublishOptions,
    ) -> Result<(), Error>
    where
        P: ProducerPayload,
    {
        for (connection, group) in group_by_connection(payloads) {
            self.with_retries(connection, options, || {
                self.publish_group(connection, &group, options.headers.as_ref())
            })
            .await?;
        }
        Ok(())
    }

    /// One attempt: publish `payloads` on a single channel of `connection`, then wait for
    /// the broker to confirm all of them.
    async fn publish_group<P>(
        &self,
        connection: &str,
        payloads: &[P],
        headers: Option<&FieldTable>,
    ) -> Result<(), Error>
    where
        P: ProducerPayload,
    {
        let messages = payloads
            .iter()
            .map(|payload| {
                let message = self.messages.make(payload, headers)?;
                Ok((
                    payload.exchange_name().unwrap_or_default(),
                    payload.routing_key().unwrap_or_default(),
                    message,
                ))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let messages = &messages;
        let timeout = self.confirm_timeout;

        self.manager
            .with_channel(connection, |channel| async move {
                channel.confirm_select().await?;
                for (exchange, routing_key, message) in messages {
                    // Mandatory: unroutable messages come back instead of being dropped.
                    channel
                        .basic_publish(exchange, routing_key, true, message)
                        .await?;
                }
                if channel.wait_for_confirms(timeout).await? {
                    Ok(())
                } else {
                    Err(Error::Confirmation)
                }
            })
            .await
    }

    /// Run `attempt` until it succeeds, the decider rejects its error, or attempts run out.
    ///
    /// `publish_failures` is incremented once per call that returns an error, whether the
    /// error was permanent or the last permitted attempt failed.
    async fn with_retries<F, Fut>(
        &self,
        connection: &str,
        options: &PublishOptions,
        mut attempt: F,
    ) -> Result<(), Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        let max_attempts = options
            .max_attempts
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
            .max(1);
        let decider = options.decider.as_deref().unwrap_or(&*self.classifier);
        let mut backoff = self.retry_policy.backoff(Arc::clone(&self.random));

        let mut attempt_number = 1;
        loop {
            self.stats.record(connection, Counter::PublishAttempts);
            let e = match attempt().await {
                Ok(()) => {
                    if attempt_number > 1 {
                        info!(
                            connection,
                            attempts = attempt_number,
                            "Publish succeeded after retrying"
                        );
                    }
                    return Ok(());
                }
                Err(e) => e,
            };

            if !decider(&e) {
                self.stats.record(connection, Counter::PublishFailures);
                error!(
                    connection,
                    attempt = attempt_number,
                    error = ?e,
                    "Publish failed with a non-retryable error"
                );
                return Err(e);
            }
            if attempt_number >= max_attempts {
                self.stats.record(connection, Counter::PublishFailures);
                error!(
                    connection,
                    attempts = attempt_number,
                    error = ?e,
                    "Publish failed, no attempts left"
                );
                return Err(e);
            }

            self.stats.record(connection, Counter::PublishRetries);
            let delay = backoff.next_sleep();
            warn!(
                connection,
                attempt = attempt_number,
                ?delay,
                error = %e,
                "Transient publish failure, retrying"
            );
            tokio::time::sleep(delay).await;

            self.manager.reset(connection).await;
            self.stats.record(connection, Counter::ConnectionResets);
            attempt_number += 1;
        }
    }
}

/// Split `payloads` by connection name, in order of first appearance.
fn group_by_connection<P: ProducerPayload>(payloads: &[P]) -> Vec<(&str, Vec<&P>)> {
    let mut groups: Vec<(&str, Vec<&P>)> = Vec::new();
    for payload in payloads {
        let name = payload.connection_name();
        match groups.iter_mut().find(|(connection, _)| *connection == name) {
            Some((_, group)) => group.push(payload),
            None => groups.push((name, vec![payload])),
        }
    }
    groups
}

/// A builder for [`Publisher`].
///
/// Use [`Publisher::builder`] as entrypoint.
pub struct PublisherBuilder {
    manager: Arc<ConnectionManager>,
    messages: MessageFactory,
    stats: Stats,
    retry_policy: RetryPolicy,
    classifier: Decider,
    random: RandomSource,
    confirm_timeout: Duration,
}

impl PublisherBuilder {
    fn new(manager: Arc<ConnectionManager>, messages: MessageFactory) -> Self {
        let retry_policy = RetryPolicy::from(&manager.settings().retry);
        Self {
            manager,
            messages,
            stats: Stats::new(),
            retry_policy,
            classifier: Arc::new(is_transient),
            random: thread_rng_source(),
            confirm_timeout: Duration::from_secs(5),
        }
    }

    /// The counters to update. Defaults to a fresh, private [`Stats`].
    #[must_use]
    pub fn stats(mut self, stats: Stats) -> Self {
        self.stats = stats;
        self
    }

    /// Defaults to the `retry` section of the manager's settings.
    #[must_use]
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Decide which errors are retried when the caller does not pass a decider.
    /// Defaults to [`is_transient`].
    #[must_use]
    pub fn classifier<D>(mut self, classifier: D) -> Self
    where
        D: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Source of the random numbers used to jitter backoff delays.
    #[must_use]
    pub fn random_source<R>(mut self, random: R) -> Self
    where
        R: Fn() -> f64 + Send + Sync + 'static,
    {
        self.random = Arc::new(random);
        self
    }

    /// Timeout applied when waiting for publisher confirms.
    /// Defaults to 5 seconds if left unspecified.
    #[must_use]
    pub fn confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    /// Finalise the builder and get an instance of [`Publisher`].
    pub fn build(self) -> Publisher {
        Publisher {
            manager: self.manager,
            messages: self.messages,
            stats: self.stats,
            retry_policy: self.retry_policy,
            classifier: self.classifier,
            random: self.random,
            confirm_timeout: self.confirm_timeout,
        }
    }
}
