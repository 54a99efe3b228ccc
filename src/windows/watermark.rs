//! Watermark tracking for event-time windows (§4.4.5).

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::PROCESS_EPOCH;

/// A monotone non-decreasing lower bound on expected event times.
pub struct WatermarkTracker {
    max_event_time_nanos: AtomicI64,
    max_out_of_orderness: Duration,
    idle_timeout: Duration,
    last_row_at: Mutex<Instant>,
}

impl WatermarkTracker {
    pub fn new(max_out_of_orderness: Duration, idle_timeout: Duration) -> Self {
        WatermarkTracker {
            max_event_time_nanos: AtomicI64::new(-1),
            max_out_of_orderness,
            idle_timeout,
            last_row_at: Mutex::new(Instant::now()),
        }
    }

    fn to_nanos(&self, t: Instant) -> i64 {
        t.saturating_duration_since(*PROCESS_EPOCH).as_nanos() as i64
    }

    fn from_nanos(&self, n: i64) -> Instant {
        *PROCESS_EPOCH + Duration::from_nanos(n.max(0) as u64)
    }

    /// Observe a row's event time; updates `max_event_time_seen` if it
    /// advances, and returns the recomputed watermark.
    pub fn observe(&self, ts: Instant) -> Instant {
        *self.last_row_at.lock() = Instant::now();
        self.max_event_time_nanos.fetch_max(self.to_nanos(ts), Ordering::SeqCst);
        self.current()
    }

    /// Recompute the watermark, applying idle-source advance if configured.
    pub fn current(&self) -> Instant {
        let max_seen = self.max_event_time_nanos.load(Ordering::SeqCst);
        if max_seen < 0 {
            return *PROCESS_EPOCH;
        }
        let event_driven = self.from_nanos(max_seen).checked_sub(self.max_out_of_orderness).unwrap_or(*PROCESS_EPOCH);
        if self.idle_timeout.is_zero() {
            return event_driven;
        }
        let idle_for = Instant::now().saturating_duration_since(*self.last_row_at.lock());
        if idle_for > self.idle_timeout {
            let wall_driven = Instant::now().checked_sub(self.max_out_of_orderness).unwrap_or(*PROCESS_EPOCH);
            event_driven.max(wall_driven)
        } else {
            event_driven
        }
    }

    pub fn is_late(&self, ts: Instant) -> bool {
        ts < self.current()
    }
}
