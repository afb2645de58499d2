use crate::amqp::configuration::{AmqpSettings, ChannelReuse};
use crate::amqp::{BrokerChannel, BrokerConnection, Connector};
use crate::system::{PidProvider, SystemPidProvider};
use crate::Error;
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tracing::{debug, info, warn};

use super::channel::{close_quietly, PooledChannel};

/// Owns one connection, and possibly one reusable channel, per connection name.
///
/// Slots are created lazily the first time a name is used. Work on a given connection is
/// serialised: [`ConnectionManager::with_channel`] holds the slot for the whole unit of work.
/// Work on different connections runs in parallel.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: AmqpSettings,
    pid_provider: Arc<dyn PidProvider>,
    recorded_pid: AtomicU32,
    fork_guard: tokio::sync::Mutex<()>,
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Slot>>>>,
}

/// The resources owned for a single connection name.
///
/// A channel is only ever present alongside a connection.
#[derive(Default)]
pub(super) struct Slot {
    pub(super) connection: Option<Arc<dyn BrokerConnection>>,
    pub(super) channel: Option<PooledChannel>,
}

impl Slot {
    /// Close the channel, then the connection. Close failures are discarded.
    async fn dispose(&mut self, name: &str) {
        if let Some(pooled) = self.channel.take() {
            close_quietly(name, pooled.channel.as_ref()).await;
        }
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                debug!(connection = name, error = %e, "Failed to close a stale connection");
            }
        }
    }
}

impl ConnectionManager {
    /// Build a manager that opens connections through `connector`, following the named
    /// definitions in `settings`.
    pub fn new(connector: impl Connector, settings: AmqpSettings) -> Self {
        Self::with_pid_provider(connector, settings, SystemPidProvider)
    }

    /// Like [`ConnectionManager::new`], with a custom source of process ids.
    pub fn with_pid_provider(
        connector: impl Connector,
        settings: AmqpSettings,
        pid_provider: impl PidProvider + 'static,
    ) -> Self {
        let recorded_pid = AtomicU32::new(pid_provider.pid());
        Self {
            connector: Arc::new(connector),
            settings,
            pid_provider: Arc::new(pid_provider),
            recorded_pid,
            fork_guard: tokio::sync::Mutex::new(()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &AmqpSettings {
        &self.settings
    }

    /// The names of every configured connection, sorted.
    pub fn connection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.settings.connections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get a usable connection for `name`, opening a new one if there is none or the
    /// current one is no longer connected.
    ///
    /// Unconfigured names use the `default` connection definition.
    pub async fn get(&self, name: &str) -> Result<Arc<dyn BrokerConnection>, Error> {
        self.detect_fork().await;
        let slot = self.slot(name);
        let mut slot = slot.lock().await;
        self.ensure_connection(name, &mut slot).await
    }

    /// Run `work` against a channel of connection `name` and return its result.
    ///
    /// With channel reuse enabled, the connection's pooled channel is used (and opened or
    /// recycled as needed); it is evicted after `work` if it got closed or ran out of uses.
    /// Without channel reuse, a fresh channel is opened for `work` and closed afterwards.
    ///
    /// In both modes the bookkeeping runs whether `work` succeeds or fails, and close failures
    /// never replace the outcome of `work`. Errors are not retried here.
    pub async fn with_channel<F, Fut, T>(&self, name: &str, work: F) -> Result<T, Error>
    where
        F: FnOnce(Arc<dyn BrokerChannel>) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.detect_fork().await;
        let slot = self.slot(name);
        let mut slot = slot.lock().await;
        let connection = self.ensure_connection(name, &mut slot).await?;

        match self.settings.channel_reuse(name) {
            ChannelReuse {
                enabled: true,
                max_uses,
            } => {
                let channel = slot.acquire_channel(name, &connection, max_uses).await?;
                let outcome = work(Arc::clone(&channel)).await;
                slot.release_channel(name, max_uses).await;
                outcome
            }
            ChannelReuse { enabled: false, .. } => {
                let channel = connection.open_channel().await?;
                let outcome = work(Arc::clone(&channel)).await;
                close_quietly(name, channel.as_ref()).await;
                outcome
            }
        }
    }

    /// Close and forget the connection and channel of `name`.
    ///
    /// Other connections are left untouched; the next use of `name` starts from scratch.
    pub async fn reset(&self, name: &str) {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        if let Some(slot) = slot {
            slot.lock().await.dispose(name).await;
            debug!(connection = name, "Connection reset");
        }
    }

    /// Close and forget every connection and channel.
    pub async fn reset_all(&self) {
        let slots: Vec<_> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
            .collect();
        for (name, slot) in slots {
            slot.lock().await.dispose(&name).await;
        }
        debug!("All connections reset");
    }

    /// Drop everything inherited from a parent process.
    ///
    /// The new pid is recorded only once the reset is over, so every caller that observes
    /// the change waits for it instead of reaching an inherited slot first.
    async fn detect_fork(&self) {
        let current = self.pid_provider.pid();
        if self.recorded_pid.load(Ordering::Acquire) == current {
            return;
        }
        let _guard = self.fork_guard.lock().await;
        let recorded = self.recorded_pid.load(Ordering::Acquire);
        if recorded == current {
            return;
        }
        warn!(
            recorded_pid = recorded,
            current_pid = current,
            "Process id changed, discarding inherited connections"
        );
        self.reset_all().await;
        self.recorded_pid.store(current, Ordering::Release);
    }

    fn slot(&self, name: &str) -> Arc<tokio::sync::Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(name.to_owned()).or_default())
    }

    async fn ensure_connection(
        &self,
        name: &str,
        slot: &mut Slot,
    ) -> Result<Arc<dyn BrokerConnection>, Error> {
        if let Some(connection) = &slot.connection {
            if connection.is_connected() {
                return Ok(Arc::clone(connection));
            }
        }
        // A channel never outlives its connection.
        slot.dispose(name).await;

        let settings = self
            .settings
            .connection(name)
            .ok_or_else(|| Error::Configuration {
                connection: name.to_owned(),
                reason: "no definition for this connection and no `default` to fall back to"
                    .into(),
            })?;
        let connection = self.connector.connect(name, settings).await?;
        info!(connection = name, "Opened a new RabbitMq connection");
        slot.connection = Some(Arc::clone(&connection));
        Ok(connection)
    }
}
