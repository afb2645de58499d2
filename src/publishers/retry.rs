use crate::amqp::configuration::RetrySettings;
use std::{sync::Arc, time::Duration};
use tracing::warn;

/// Draws a number in `[0, 1]`. Used to jitter backoff delays.
pub type RandomSource = Arc<dyn Fn() -> f64 + Send + Sync>;

/// The lower bound of the jitter factor; the upper bound is `JITTER_FLOOR + JITTER_SPREAD`.
const JITTER_FLOOR: f64 = 0.85;
const JITTER_SPREAD: f64 = 0.30;

/// How long to wait between two publish attempts.
///
/// The first delay is `base_delay`; every following one doubles, up to `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Scale every delay by a random factor in `[0.85, 1.15]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        let defaults = RetrySettings::default();
        Self {
            base_delay: seconds("base_delay", settings.base_delay, defaults.base_delay),
            max_delay: seconds("max_delay", settings.max_delay, defaults.max_delay),
            jitter: settings.jitter,
        }
    }
}

/// Negative values become zero; values no `Duration` can hold fall back to `default`.
fn seconds(field: &str, value: f64, default: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or_else(|_| {
        warn!(field, value, "Retry delay out of range, using the default");
        Duration::from_secs_f64(default)
    })
}

impl RetryPolicy {
    /// Start a new sequence of delays.
    pub fn backoff(&self, random: RandomSource) -> Backoff {
        Backoff {
            policy: *self,
            delay: self.base_delay,
            random,
        }
    }
}

/// The delays of one retry sequence.
pub struct Backoff {
    policy: RetryPolicy,
    delay: Duration,
    random: RandomSource,
}

impl Backoff {
    /// The time to sleep before the next attempt.
    pub fn next_sleep(&mut self) -> Duration {
        let sleep = if self.policy.jitter {
            let r = match (self.random)() {
                r if r.is_nan() => 0.5,
                r => r.clamp(0.0, 1.0),
            };
            let factor = JITTER_FLOOR + r * JITTER_SPREAD;
            Duration::try_from_secs_f64(self.delay.as_secs_f64() * factor).unwrap_or(self.delay)
        } else {
            self.delay
        };
        self.delay = self.delay.saturating_mul(2).min(self.policy.max_delay);
        sleep
    }
}

/// The default random source, backed by the thread-local generator of `rand`.
pub fn thread_rng_source() -> RandomSource {
    Arc::new(rand::random::<f64>)
}
