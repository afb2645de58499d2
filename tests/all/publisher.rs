use crate::helpers::{manager, publisher, settings, Broker, Fault};
use carrot_relay::amqp::configuration::DEFAULT_CONNECTION;
use carrot_relay::amqp::convenience::{string_value, BasicPropertiesExt};
use carrot_relay::amqp::types::FieldTable;
use carrot_relay::publishers::{Payload, ProducerPayload, PublishOptions, Publisher, RetryPolicy};
use carrot_relay::stats::{Counter, Stats};
use carrot_relay::{is_transient, Error};
use serde::{Serialize, Serializer};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;

fn order(id: u32) -> Payload<serde_json::Value> {
    Payload::new(serde_json::json!({ "order_id": id }))
        .with_exchange("orders.ex")
        .with_routing_key("order.created")
}

#[tokio::test(start_paused = true)]
async fn a_transient_failure_is_retried_and_recovers() {
    // Arrange
    let broker = Broker::new();
    let stats = Stats::new();
    let publisher = publisher(manager(&broker, settings()), &stats);
    broker.inject(DEFAULT_CONNECTION, [Fault::Transient]);

    // Act
    publisher
        .publish_with(&order(1), &PublishOptions::new().max_attempts(2))
        .await
        .unwrap();

    // Assert
    assert_eq!(2, broker.publish_calls(DEFAULT_CONNECTION));
    assert_eq!(1, broker.published().len());
    let snapshot = stats.snapshot();
    assert_eq!(2, snapshot.publish_attempts);
    assert_eq!(1, snapshot.publish_retries);
    assert_eq!(1, snapshot.connection_resets);
    assert_eq!(0, snapshot.publish_failures);
    assert_eq!(1, snapshot.for_connection(DEFAULT_CONNECTION, Counter::PublishRetries));
    // The retry ran on a brand new connection.
    assert_eq!(2, broker.connections_opened(DEFAULT_CONNECTION));
}

#[tokio::test(start_paused = true)]
async fn a_permanent_failure_is_not_retried() {
    // Arrange
    let broker = Broker::new();
    let stats = Stats::new();
    let publisher = publisher(manager(&broker, settings()), &stats);
    broker.inject(DEFAULT_CONNECTION, [Fault::Permanent; 5]);

    // Act
    let outcome = publisher
        .publish_with(&order(1), &PublishOptions::new().max_attempts(5))
        .await;

    // Assert
    assert!(matches!(outcome, Err(Error::Application(_))));
    assert_eq!(1, broker.publish_calls(DEFAULT_CONNECTION));
    let snapshot = stats.snapshot();
    assert_eq!(1, snapshot.publish_attempts);
    assert_eq!(1, snapshot.publish_failures);
    assert_eq!(0, snapshot.publish_retries);
    assert_eq!(0, snapshot.connection_resets);
    assert_eq!(1, broker.connections_opened(DEFAULT_CONNECTION));
}

#[tokio::test(start_paused = true)]
async fn exhausting_attempts_counts_a_single_failure_and_skips_the_last_backoff() {
    // Arrange
    let broker = Broker::new();
    let stats = Stats::new();
    let publisher = publisher(manager(&broker, settings()), &stats);
    broker.inject(DEFAULT_CONNECTION, [Fault::Transient; 3]);
    let start = Instant::now();

    // Act
    let outcome = publisher.publish(&order(1)).await;

    // Assert
    assert!(matches!(outcome, Err(Error::Broker(_))));
    assert_eq!(3, broker.publish_calls(DEFAULT_CONNECTION));
    let snapshot = stats.snapshot();
    assert_eq!(3, snapshot.publish_attempts);
    assert_eq!(2, snapshot.publish_retries);
    assert_eq!(2, snapshot.connection_resets);
    assert_eq!(1, snapshot.publish_failures);
    // 200ms + 400ms of backoff; a third sleep would add 800ms.
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(600), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1400), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn max_attempts_below_one_still_attempts_once() {
    let broker = Broker::new();
    let stats = Stats::new();
    let publisher = publisher(manager(&broker, settings()), &stats);
    broker.inject(DEFAULT_CONNECTION, [Fault::Transient]);

    let outcome = publisher
        .publish_with(&order(1), &PublishOptions::new().max_attempts(0))
        .await;

    assert!(outcome.is_err());
    assert_eq!(1, broker.publish_calls(DEFAULT_CONNECTION));
    assert_eq!(1, stats.snapshot().publish_failures);
    assert_eq!(0, stats.snapshot().publish_retries);
}

#[tokio::test(start_paused = true)]
async fn a_missing_confirm_is_retried_by_default() {
    // Arrange
    let broker = Broker::new();
    let stats = Stats::new();
    let publisher = publisher(manager(&broker, settings()), &stats);
    broker.inject(DEFAULT_CONNECTION, [Fault::Nack]);

    // Act
    publisher.publish(&order(1)).await.unwrap();

    // Assert
    // At-least-once: the unconfirmed message went out, then its retry.
    assert_eq!(2, broker.published().len());
    assert_eq!(1, stats.snapshot().publish_retries);
}

#[tokio::test(start_paused = true)]
async fn a_caller_decider_overrides_the_classifier() {
    // Arrange
    let broker = Broker::new();
    let stats = Stats::new();
    let publisher = publisher(manager(&broker, settings()), &stats);
    broker.inject(DEFAULT_CONNECTION, [Fault::Nack]);
    let options = PublishOptions::new().decider(|e| !matches!(e, Error::Confirmation));

    // Act
    let outcome = publisher.publish_with(&order(1), &options).await;

    // Assert
    assert!(matches!(outcome, Err(Error::Confirmation)));
    assert_eq!(1, stats.snapshot().publish_attempts);
    assert_eq!(1, stats.snapshot().publish_failures);
}

#[tokio::test(start_paused = true)]
async fn the_builder_classifier_applies_when_no_decider_is_given() {
    // Arrange
    let broker = Broker::new();
    let stats = Stats::new();
    let publisher = Publisher::builder(
        manager(&broker, settings()),
        carrot_relay::publishers::MessageFactory::new("billing", "test"),
    )
    .stats(stats.clone())
    .classifier(|_| false)
    .build();
    broker.inject(DEFAULT_CONNECTION, [Fault::Transient]);

    // Act
    let outcome = publisher.publish(&order(1)).await;

    // Assert
    assert!(matches!(outcome, Err(Error::Broker(_))));
    assert_eq!(1, broker.publish_calls(DEFAULT_CONNECTION));
    assert_eq!(0, stats.snapshot().publish_retries);
}

struct Unserializable;

impl Serialize for Unserializable {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom("cannot encode"))
    }
}

#[tokio::test(start_paused = true)]
async fn serialization_failures_fail_fast_with_a_distinct_error() {
    // Arrange
    let broker = Broker::new();
    let stats = Stats::new();
    let publisher = publisher(manager(&broker, settings()), &stats);

    // Act
    let outcome = publisher.publish(&Payload::new(Unserializable)).await;

    // Assert
    let error = outcome.unwrap_err();
    assert!(matches!(error, Error::Serialization(_)));
    assert_eq!("Payload serialization failed", error.to_string());
    assert_eq!(0, broker.publish_calls(DEFAULT_CONNECTION));
    assert_eq!(1, stats.snapshot().publish_attempts);
    assert_eq!(1, stats.snapshot().publish_failures);
}

#[tokio::test(start_paused = true)]
async fn messages_are_routed_as_their_payload_says() {
    // Arrange
    let broker = Broker::new();
    let stats = Stats::new();
    let publisher = publisher(manager(&broker, settings()), &stats);
    let mut headers = FieldTable::default();
    headers.insert("env".into(), string_value("staging"));

    // Act
    publisher
        .publish_with(&order(7), &PublishOptions::new().headers(headers))
        .await
        .unwrap();
    publisher.publish(&Payload::new("bare")).await.unwrap();

    // Assert
    let published = broker.published();
    assert_eq!("orders.ex", published[0].exchange);
    assert_eq!("order.created", published[0].routing_key);
    assert!(published[0].mandatory);
    assert_eq!(br#"{"order_id":7}"#.to_vec(), published[0].message.body);
    let properties = &published[0].message.properties;
    assert_eq!(Some("staging"), properties.get_header_str("env").as_deref());
    assert_eq!(Some("billing"), properties.get_header_str("source").as_deref());

    assert_eq!("", published[1].exchange);
    assert_eq!("", published[1].routing_key);
    assert_eq!(Some("test"), published[1].message.properties.get_header_str("env").as_deref());
}

#[tokio::test(start_paused = true)]
async fn a_batch_goes_out_on_one_channel_per_connection() {
    // Arrange
    let broker = Broker::new();
    let stats = Stats::new();
    let publisher = publisher(manager(&broker, settings()), &stats);
    let payloads = vec![
        order(1),
        order(2).with_connection("secondary"),
        order(3),
    ];

    // Act
    publisher.batch_publish(&payloads).await.unwrap();

    // Assert
    let published = broker.published();
    let on_default: Vec<_> = published
        .iter()
        .filter(|p| p.connection == DEFAULT_CONNECTION)
        .collect();
    assert_eq!(2, on_default.len());
    assert_eq!(on_default[0].channel_id, on_default[1].channel_id);
    assert_eq!(br#"{"order_id":1}"#.to_vec(), on_default[0].message.body);
    assert_eq!(br#"{"order_id":3}"#.to_vec(), on_default[1].message.body);
    // One attempt per group.
    assert_eq!(2, stats.snapshot().publish_attempts);
    assert_eq!(1, stats.snapshot().for_connection("secondary", Counter::PublishAttempts));
}

#[tokio::test(start_paused = true)]
async fn a_transient_failure_in_one_group_does_not_affect_the_others() {
    // Arrange
    let broker = Broker::new();
    let stats = Stats::new();
    let publisher = publisher(manager(&broker, settings()), &stats);
    broker.inject("secondary", [Fault::Transient]);
    let payloads = vec![order(1), order(2).with_connection("secondary")];

    // Act
    publisher.batch_publish(&payloads).await.unwrap();

    // Assert
    let snapshot = stats.snapshot();
    assert_eq!(0, snapshot.for_connection(DEFAULT_CONNECTION, Counter::ConnectionResets));
    assert_eq!(0, snapshot.for_connection(DEFAULT_CONNECTION, Counter::PublishRetries));
    assert_eq!(1, snapshot.for_connection("secondary", Counter::ConnectionResets));
    assert_eq!(1, snapshot.for_connection("secondary", Counter::PublishRetries));
    assert_eq!(1, broker.connections_opened(DEFAULT_CONNECTION));
    assert_eq!(2, broker.connections_opened("secondary"));
    assert_eq!(2, broker.published().len());
}

#[tokio::test(start_paused = true)]
async fn a_failed_group_stops_the_batch() {
    // Arrange
    let broker = Broker::new();
    let stats = Stats::new();
    let publisher = publisher(manager(&broker, settings()), &stats);
    broker.inject(DEFAULT_CONNECTION, [Fault::Permanent]);
    let payloads = vec![order(1), order(2).with_connection("secondary")];

    // Act
    let outcome = publisher.batch_publish(&payloads).await;

    // Assert
    assert!(outcome.is_err());
    assert_eq!(0, broker.publish_calls("secondary"));
    assert_eq!(1, stats.snapshot().publish_failures);
}

#[tokio::test(start_paused = true)]
async fn an_empty_batch_is_a_no_op() {
    let broker = Broker::new();
    let stats = Stats::new();
    let publisher = publisher(manager(&broker, settings()), &stats);
    let payloads: Vec<Payload<u32>> = vec![];

    publisher.batch_publish(&payloads).await.unwrap();

    assert_eq!(0, broker.total_connections_opened());
    assert_eq!(Stats::new().snapshot(), stats.snapshot());
}

#[tokio::test(start_paused = true)]
async fn heterogeneous_payloads_can_be_batched() {
    let broker = Broker::new();
    let stats = Stats::new();
    let publisher = publisher(manager(&broker, settings()), &stats);
    let first = order(1);
    let second = Payload::new("text").with_connection("secondary");
    let payloads: Vec<&dyn ProducerPayload> = vec![&first, &second];

    publisher.batch_publish(&payloads).await.unwrap();

    assert_eq!(2, broker.published().len());
}

#[tokio::test(start_paused = true)]
async fn jitter_perturbs_each_backoff_within_fifteen_percent() {
    // Arrange
    let broker = Broker::new();
    let stats = Stats::new();
    let draws = Mutex::new(vec![0.0, 1.0].into_iter());
    let publisher = Publisher::builder(
        manager(&broker, settings()),
        carrot_relay::publishers::MessageFactory::new("billing", "test"),
    )
    .stats(stats.clone())
    .retry_policy(RetryPolicy {
        base_delay: Duration::from_millis(200),
        max_delay: Duration::from_millis(1500),
        jitter: true,
    })
    .random_source(move || draws.lock().unwrap().next().unwrap_or(0.5))
    .build();
    broker.inject(DEFAULT_CONNECTION, [Fault::Transient; 2]);

    // The decider runs right before each backoff sleep.
    let failures = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&failures);
    let options = PublishOptions::new().decider(move |e| {
        recorded.lock().unwrap().push(Instant::now());
        is_transient(e)
    });

    // Act
    publisher.publish_with(&order(1), &options).await.unwrap();
    let done = Instant::now();

    // Assert
    let failures = failures.lock().unwrap().clone();
    assert_eq!(2, failures.len());
    let first_sleep = failures[1] - failures[0];
    let second_sleep = done - failures[1];
    assert_jittered(first_sleep, Duration::from_millis(200));
    assert_jittered(second_sleep, Duration::from_millis(400));
    assert_ne!(first_sleep * 2, second_sleep);
    // The smallest draw shortens the delay, the largest one stretches it.
    assert!(first_sleep < Duration::from_millis(200));
    assert!(second_sleep > Duration::from_millis(400));
}

/// `sleep` is within `[0.85, 1.15] × delay`, give or take the timer resolution.
fn assert_jittered(sleep: Duration, delay: Duration) {
    let resolution = Duration::from_millis(2);
    assert!(sleep + resolution >= delay.mul_f64(0.85), "{sleep:?} vs {delay:?}");
    assert!(sleep <= delay.mul_f64(1.15) + resolution, "{sleep:?} vs {delay:?}");
}

#[tokio::test(start_paused = true)]
async fn backoff_does_not_block_other_publishes_on_the_same_connection() {
    // Arrange
    let broker = Broker::new();
    let stats = Stats::new();
    let publisher = publisher(manager(&broker, settings()), &stats);
    broker.inject(DEFAULT_CONNECTION, [Fault::Transient]);
    let start = Instant::now();

    // Act
    let first = order(1);
    let (retried, unaffected) = tokio::join!(publisher.publish(&first), async {
        publisher.publish(&order(2)).await.map(|()| Instant::now())
    });

    // Assert
    retried.unwrap();
    assert_eq!(start, unaffected.unwrap());
    assert_eq!(3, broker.publish_calls(DEFAULT_CONNECTION));
}
