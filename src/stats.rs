//! Operational counters for the publisher, globally and per named connection.
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// The kinds of event that are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    /// A publish attempt was made (before confirm).
    PublishAttempts,
    /// A failed attempt is going to be retried.
    PublishRetries,
    /// A publish operation failed for good.
    PublishFailures,
    /// The publisher discarded a connection between attempts.
    ConnectionResets,
}

impl Counter {
    pub const ALL: [Counter; 4] = [
        Counter::PublishAttempts,
        Counter::PublishRetries,
        Counter::PublishFailures,
        Counter::ConnectionResets,
    ];

    /// The stable key of the counter, e.g. `publish_attempts`.
    pub fn key(self) -> &'static str {
        match self {
            Counter::PublishAttempts => "publish_attempts",
            Counter::PublishRetries => "publish_retries",
            Counter::PublishFailures => "publish_failures",
            Counter::ConnectionResets => "connection_resets",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.key() == key)
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A thread-safe store of publisher counters.
///
/// `Stats` is a cheap handle: clones share the same counters. Build one per composition
/// root and hand it to the [`Publisher`](crate::publishers::Publisher); tests can build
/// independent instances instead of resetting a shared one.
///
/// A single lock guards every counter, so a [`snapshot`](Stats::snapshot) never observes a
/// half-applied update.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    inner: Arc<Mutex<Counters>>,
}

#[derive(Debug, Default)]
struct Counters {
    global: [u64; Counter::ALL.len()],
    per_connection: BTreeMap<String, BTreeMap<Counter, u64>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        // Counters stay consistent even if a holder panicked: every update is a single add.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `amount` to a global counter.
    pub fn increment(&self, counter: Counter, amount: u64) {
        self.counters().global[counter.index()] += amount;
    }

    /// Add `amount` to the global counter named `key`.
    ///
    /// Unknown keys are ignored, so a typo cannot grow the set of counters.
    pub fn increment_key(&self, key: &str, amount: u64) {
        if let Some(counter) = Counter::from_key(key) {
            self.increment(counter, amount);
        }
    }

    /// Add `amount` to the counter of a single connection.
    pub fn increment_for_connection(&self, connection: &str, counter: Counter, amount: u64) {
        let mut counters = self.counters();
        *counters
            .per_connection
            .entry(connection.to_owned())
            .or_default()
            .entry(counter)
            .or_default() += amount;
    }

    /// Count one event both globally and for `connection`, under a single lock.
    pub fn record(&self, connection: &str, counter: Counter) {
        let mut counters = self.counters();
        counters.global[counter.index()] += 1;
        *counters
            .per_connection
            .entry(connection.to_owned())
            .or_default()
            .entry(counter)
            .or_default() += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self.counters();
        let global = |counter: Counter| counters.global[counter.index()];
        StatsSnapshot {
            publish_attempts: global(Counter::PublishAttempts),
            publish_retries: global(Counter::PublishRetries),
            publish_failures: global(Counter::PublishFailures),
            connection_resets: global(Counter::ConnectionResets),
            per_connection: counters.per_connection.clone(),
        }
    }

    /// Zero every global counter and forget every connection.
    pub fn reset(&self) {
        *self.counters() = Counters::default();
    }
}

/// A point-in-time copy of every counter.
///
/// Connections only list the counters that were incremented at least once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub publish_attempts: u64,
    pub publish_retries: u64,
    pub publish_failures: u64,
    pub connection_resets: u64,
    pub per_connection: BTreeMap<String, BTreeMap<Counter, u64>>,
}

impl StatsSnapshot {
    pub fn get(&self, counter: Counter) -> u64 {
        match counter {
            Counter::PublishAttempts => self.publish_attempts,
            Counter::PublishRetries => self.publish_retries,
            Counter::PublishFailures => self.publish_failures,
            Counter::ConnectionResets => self.connection_resets,
        }
    }

    /// The value of `counter` for `connection`, zero if it was never incremented.
    pub fn for_connection(&self, connection: &str, counter: Counter) -> u64 {
        self.per_connection
            .get(connection)
            .and_then(|counters| counters.get(&counter))
            .copied()
            .unwrap_or_default()
    }
}
