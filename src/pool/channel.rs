//! Reusable channel bookkeeping.
use crate::amqp::{BrokerChannel, BrokerConnection};
use crate::Error;
use std::sync::Arc;
use tracing::debug;

use super::connection::Slot;

/// The reusable channel of a connection and how many units of work it has served.
pub(super) struct PooledChannel {
    pub(super) channel: Arc<dyn BrokerChannel>,
    pub(super) uses: usize,
}

impl Slot {
    /// Hand out the pooled channel, replacing it first if it is closed or exhausted.
    pub(super) async fn acquire_channel(
        &mut self,
        name: &str,
        connection: &Arc<dyn BrokerConnection>,
        max_uses: usize,
    ) -> Result<Arc<dyn BrokerChannel>, Error> {
        if let Some(pooled) = &self.channel {
            if pooled.channel.is_open() && pooled.uses < max_uses {
                return Ok(Arc::clone(&pooled.channel));
            }
        }
        if let Some(stale) = self.channel.take() {
            close_quietly(name, stale.channel.as_ref()).await;
        }

        let channel = connection.open_channel().await?;
        self.channel = Some(PooledChannel {
            channel: Arc::clone(&channel),
            uses: 0,
        });
        Ok(channel)
    }

    /// Count one use of the pooled channel and evict it if it got closed or hit `max_uses`.
    pub(super) async fn release_channel(&mut self, name: &str, max_uses: usize) {
        let Some(pooled) = self.channel.as_mut() else {
            return;
        };
        pooled.uses += 1;
        if !pooled.channel.is_open() || pooled.uses >= max_uses {
            if let Some(evicted) = self.channel.take() {
                debug!(
                    connection = name,
                    uses = evicted.uses,
                    "Recycling the reusable channel"
                );
                close_quietly(name, evicted.channel.as_ref()).await;
            }
        }
    }
}

/// Close `channel` if it is still open, discarding any failure.
pub(super) async fn close_quietly(name: &str, channel: &dyn BrokerChannel) {
    if !channel.is_open() {
        return;
    }
    if let Err(e) = channel.close().await {
        debug!(connection = name, error = %e, "Failed to close a channel");
    }
}
