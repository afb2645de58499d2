//! Connectivity checks for named connections.
use crate::pool::ConnectionManager;
use std::{collections::BTreeMap, sync::Arc};
use tracing::warn;

/// Opens a connection and a channel for each name to verify the broker is reachable.
pub struct HealthChecker {
    manager: Arc<ConnectionManager>,
}

impl HealthChecker {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Run a no-op unit of work on every named connection.
    ///
    /// Empty names are skipped. Failures are reported as `false`, never as errors.
    pub async fn ping<I, S>(&self, names: I) -> BTreeMap<String, bool>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut results = BTreeMap::new();
        for name in names {
            let name = name.as_ref();
            if name.is_empty() {
                continue;
            }
            let healthy = match self.manager.with_channel(name, |_| async { Ok(()) }).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(connection = name, error = %e, "RabbitMq health check failed");
                    false
                }
            };
            results.insert(name.to_owned(), healthy);
        }
        results
    }

    /// Ping every configured connection.
    pub async fn ping_all(&self) -> BTreeMap<String, bool> {
        self.ping(self.manager.connection_names()).await
    }

    /// `true` if every result of a [`ping`](HealthChecker::ping) is healthy.
    pub fn all_ok(results: &BTreeMap<String, bool>) -> bool {
        results.values().all(|healthy| *healthy)
    }
}
