use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock in unix seconds. Shard deadlines are compared against it.
pub trait Clock: Send + Sync {
    fn now_unix_secs(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|value| value.as_secs())
            .unwrap_or(0)
    }
}

/// Unix time that advances with the tokio clock, so paused-time tests can
/// drive deadlines and timers together.
#[derive(Debug, Clone, Copy)]
pub struct InstantClock {
    origin_unix_secs: u64,
    started: tokio::time::Instant,
}

impl InstantClock {
    pub fn new(origin_unix_secs: u64) -> Self {
        Self {
            origin_unix_secs,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for InstantClock {
    fn now_unix_secs(&self) -> u64 {
        self.origin_unix_secs + self.started.elapsed().as_secs()
    }
}
