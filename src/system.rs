//! Process-level facts the crate depends on: the current time and the current process id.
use chrono::{DateTime, Utc};

/// Supplies the current time, used to stamp outgoing messages.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Reports the id of the current process.
///
/// The [`ConnectionManager`](crate::pool::ConnectionManager) compares it against the id it
/// recorded earlier to detect that the process has forked: sockets and channels inherited
/// from the parent must not be used by the child.
pub trait PidProvider: Send + Sync {
    fn pid(&self) -> u32;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPidProvider;

impl PidProvider for SystemPidProvider {
    fn pid(&self) -> u32 {
        std::process::id()
    }
}
