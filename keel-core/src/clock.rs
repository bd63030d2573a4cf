//! Clock - Time source for timestamps and poll intervals

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::accessor::BoxFuture;

/// Time source used by the reconciler
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Wait between two poll attempts
    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()>;
}

/// Wall clock backed by tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Virtual clock: sleeping advances time instantly and is counted
#[derive(Debug)]
pub struct ManualClock {
    inner: Mutex<ManualClockState>,
}

#[derive(Debug)]
struct ManualClockState {
    now: DateTime<Utc>,
    sleeps: usize,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(ManualClockState {
                now: start,
                sleeps: 0,
            }),
        }
    }

    /// Number of completed sleeps
    pub fn sleeps(&self) -> usize {
        self.inner.lock().map(|s| s.sleeps).unwrap_or_default()
    }

    pub fn advance(&self, duration: Duration) {
        if let Ok(mut state) = self.inner.lock() {
            state.now += chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::default())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().map(|s| s.now).unwrap_or_else(|_| Utc::now())
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()> {
        self.advance(duration);
        if let Ok(mut state) = self.inner.lock() {
            state.sleeps += 1;
        }
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_clock_counts_and_advances() {
        let clock = ManualClock::default();
        let start = clock.now();

        clock.sleep(Duration::from_secs(5)).await;
        clock.sleep(Duration::from_secs(5)).await;

        assert_eq!(clock.sleeps(), 2);
        assert_eq!((clock.now() - start).num_seconds(), 10);
    }
}
