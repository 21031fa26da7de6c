use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const NONE: i64 = i64::MIN;

struct Inner {
    origin: Instant,
    last_beat_ms: AtomicU64,
    last_candle: AtomicI64,
    last_signal_extreme: AtomicI64,
}

/// Liveness and progress the worker publishes for the supervisor
///
/// The worker writes, the supervisor reads. No trading state crosses this boundary.
#[derive(Clone)]
pub struct Heartbeat {
    inner: Arc<Inner>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                origin: Instant::now(),
                last_beat_ms: AtomicU64::new(0),
                last_candle: AtomicI64::new(NONE),
                last_signal_extreme: AtomicI64::new(NONE),
            }),
        }
    }

    pub fn beat(&self) {
        let elapsed = self.inner.origin.elapsed().as_millis() as u64;
        self.inner.last_beat_ms.store(elapsed, Ordering::SeqCst);
    }

    /// Time since the last beat
    pub fn since_last_beat(&self) -> Duration {
        let now = self.inner.origin.elapsed().as_millis() as u64;
        let last = self.inner.last_beat_ms.load(Ordering::SeqCst);
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Mark `timestamp` as processed; never moves backwards
    pub fn record_candle(&self, timestamp: i64) {
        self.inner.last_candle.fetch_max(timestamp, Ordering::SeqCst);
    }

    pub fn record_signal(&self, extreme_timestamp: i64) {
        self.inner
            .last_signal_extreme
            .fetch_max(extreme_timestamp, Ordering::SeqCst);
    }

    pub fn last_processed_candle(&self) -> Option<i64> {
        read(&self.inner.last_candle)
    }

    pub fn last_signal_extreme(&self) -> Option<i64> {
        read(&self.inner.last_signal_extreme)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

fn read(cell: &AtomicI64) -> Option<i64> {
    match cell.load(Ordering::SeqCst) {
        NONE => None,
        value => Some(value),
    }
}
