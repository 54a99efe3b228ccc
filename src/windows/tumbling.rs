//! Tumbling window (§4.4.1): non-overlapping fixed-size intervals.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{EngineError, Result};
use crate::types::{Row, TimeCharacteristic, TimeSlot, WindowConfig, WindowKind};

use super::watermark::WatermarkTracker;
use super::{aligned_window_start, Callback, Window, PROCESS_EPOCH};

struct Bucket {
    slot: TimeSlot,
    rows: Vec<Row>,
    emitted_once: bool,
    dirty: bool,
}

pub struct TumblingWindow {
    size: Duration,
    config: WindowConfig,
    buckets: Mutex<BTreeMap<Instant, Bucket>>,
    origin: Mutex<Option<Instant>>,
    watermark: Option<WatermarkTracker>,
    callback: Mutex<Option<Callback>>,
    output_tx: mpsc::Sender<Vec<Row>>,
    output_rx: Mutex<Option<mpsc::Receiver<Vec<Row>>>>,
    stopped: AtomicBool,
    /// Highest `slot.start` of any bucket purged by `check_triggers` so far.
    /// A row whose slot falls at or before this floor arrives after its
    /// window has already fired and been removed, and must be discarded
    /// rather than resurrecting a one-row bucket that would itself purge.
    purged_floor: Mutex<Option<Instant>>,
}

impl TumblingWindow {
    pub fn new(config: WindowConfig, output_capacity: usize) -> Result<Self> {
        let size = match config.kind {
            WindowKind::Tumbling { size } => size,
            _ => return Err(EngineError::config("TumblingWindow requires a Tumbling WindowKind")),
        };
        let watermark = match config.time_characteristic {
            TimeCharacteristic::EventTime => {
                Some(WatermarkTracker::new(config.max_out_of_orderness, config.idle_timeout))
            }
            TimeCharacteristic::ProcessingTime => None,
        };
        let (output_tx, output_rx) = mpsc::channel(output_capacity.max(1));
        Ok(TumblingWindow {
            size,
            config,
            buckets: Mutex::new(BTreeMap::new()),
            origin: Mutex::new(None),
            watermark,
            callback: Mutex::new(None),
            output_tx,
            output_rx: Mutex::new(Some(output_rx)),
            stopped: AtomicBool::new(false),
            purged_floor: Mutex::new(None),
        })
    }

    fn slot_for(&self, ts: Instant, arrival_now: Instant) -> TimeSlot {
        let start = match self.config.time_characteristic {
            TimeCharacteristic::EventTime => aligned_window_start(ts, *PROCESS_EPOCH, self.size),
            TimeCharacteristic::ProcessingTime => {
                let mut origin = self.origin.lock();
                let origin = *origin.get_or_insert(arrival_now);
                aligned_window_start(arrival_now, origin, self.size)
            }
        };
        TimeSlot::new(start, start + self.size)
    }

    fn check_triggers(&self, boundary: Instant) {
        let allowed = self.config.allowed_lateness;
        let mut to_emit = Vec::new();
        let mut buckets = self.buckets.lock();
        let due: Vec<Instant> = buckets
            .iter()
            .filter(|(_, b)| b.slot.end <= boundary)
            .map(|(start, _)| *start)
            .collect();
        let mut newly_purged: Option<Instant> = None;
        for start in due {
            let remove = {
                let bucket = buckets.get_mut(&start).unwrap();
                if !bucket.emitted_once || bucket.dirty {
                    let slot = bucket.slot;
                    to_emit.push(bucket.rows.clone().into_iter().map(|r| r.with_slot(slot)).collect::<Vec<_>>());
                    bucket.emitted_once = true;
                    bucket.dirty = false;
                }
                allowed.is_zero() || boundary >= bucket.slot.end + allowed
            };
            if remove {
                buckets.remove(&start);
                newly_purged = Some(newly_purged.map_or(start, |cur| cur.max(start)));
            }
        }
        drop(buckets);
        if let Some(purged) = newly_purged {
            let mut floor = self.purged_floor.lock();
            *floor = Some(floor.map_or(purged, |cur| cur.max(purged)));
        }
        for rows in to_emit {
            self.emit_rows(rows);
        }
    }

    fn emit_rows(&self, rows: Vec<Row>) {
        if rows.is_empty() {
            return;
        }
        if let Some(cb) = self.callback.lock().as_ref() {
            cb(&rows);
        }
        let tx = self.output_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(rows).await;
        });
    }
}

#[async_trait]
impl Window for TumblingWindow {
    fn add(&self, row: Row) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        let event_time = matches!(self.config.time_characteristic, TimeCharacteristic::EventTime);
        let slot = self.slot_for(row.timestamp, now);
        if self.purged_floor.lock().is_some_and(|floor| slot.start <= floor) {
            return;
        }
        {
            let mut buckets = self.buckets.lock();
            let bucket =
                buckets.entry(slot.start).or_insert_with(|| Bucket { slot, rows: Vec::new(), emitted_once: false, dirty: false });
            bucket.rows.push(row.clone());
            if bucket.emitted_once {
                bucket.dirty = true;
            }
        }
        let boundary = match &self.watermark {
            Some(wm) => wm.observe(row.timestamp),
            None => now,
        };
        if event_time {
            self.check_triggers(boundary);
        }
    }

    async fn start(self: Arc<Self>) {
        let interval_dur = match self.config.time_characteristic {
            TimeCharacteristic::EventTime => self.config.watermark_interval.max(Duration::from_millis(1)),
            TimeCharacteristic::ProcessingTime => self.size.max(Duration::from_millis(1)),
        };
        let mut ticker = tokio::time::interval(interval_dur);
        loop {
            ticker.tick().await;
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            let boundary = match &self.watermark {
                Some(wm) => wm.current(),
                None => Instant::now(),
            };
            self.check_triggers(boundary);
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn trigger(&self) {
        let mut buckets = self.buckets.lock();
        let all: Vec<Vec<Row>> = buckets
            .values()
            .map(|b| b.rows.clone().into_iter().map(|r| r.with_slot(b.slot)).collect())
            .collect();
        buckets.clear();
        drop(buckets);
        for rows in all {
            self.emit_rows(rows);
        }
    }

    fn reset(&self) {
        self.buckets.lock().clear();
        *self.origin.lock() = None;
    }

    fn set_callback(&self, cb: Callback) {
        *self.callback.lock() = Some(cb);
    }

    fn take_output(&self) -> mpsc::Receiver<Vec<Row>> {
        self.output_rx.lock().take().expect("tumbling window output already taken")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NestedValue, TimeUnit};

    fn row_at(ts: Instant) -> Row {
        Row::new(NestedValue::Null, ts)
    }

    #[test]
    fn processing_time_buckets_by_arrival() {
        let config = WindowConfig {
            kind: WindowKind::Tumbling { size: Duration::from_secs(60) },
            time_characteristic: TimeCharacteristic::ProcessingTime,
            time_unit: TimeUnit::S,
            ..Default::default()
        };
        let window = TumblingWindow::new(config, 8).unwrap();
        let now = Instant::now();
        window.add(row_at(now));
        window.add(row_at(now));
        assert_eq!(window.buckets.lock().len(), 1);
    }

    #[test]
    fn event_time_triggers_on_watermark_advance() {
        let config = WindowConfig {
            kind: WindowKind::Tumbling { size: Duration::from_secs(2) },
            time_characteristic: TimeCharacteristic::EventTime,
            max_out_of_orderness: Duration::ZERO,
            allowed_lateness: Duration::ZERO,
            time_unit: TimeUnit::S,
            ..Default::default()
        };
        let window = Arc::new(TumblingWindow::new(config, 8).unwrap());
        let mut rx = window.take_output();
        let base = *PROCESS_EPOCH;
        window.add(row_at(base + Duration::from_secs(0)));
        window.add(row_at(base + Duration::from_secs(1)));
        // this row's timestamp advances the watermark past the first window's end
        window.add(row_at(base + Duration::from_secs(2)));
        let batch = rx.try_recv().expect("first window should have triggered");
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn late_row_for_an_already_purged_slot_is_discarded() {
        let config = WindowConfig {
            kind: WindowKind::Tumbling { size: Duration::from_secs(2) },
            time_characteristic: TimeCharacteristic::EventTime,
            max_out_of_orderness: Duration::ZERO,
            allowed_lateness: Duration::ZERO,
            time_unit: TimeUnit::S,
            ..Default::default()
        };
        let window = Arc::new(TumblingWindow::new(config, 8).unwrap());
        let mut rx = window.take_output();
        let base = *PROCESS_EPOCH;
        window.add(row_at(base + Duration::from_secs(0)));
        // advances the watermark past [0, 2) and purges it
        window.add(row_at(base + Duration::from_secs(2)));
        rx.try_recv().expect("first window should have triggered and purged");

        // a row for the already-purged [0, 2) slot must not resurrect it
        window.add(row_at(base + Duration::from_millis(500)));
        assert_eq!(window.buckets.lock().len(), 1, "only the still-open [2, 4) bucket remains");
        assert!(rx.try_recv().is_err(), "no spurious re-emission for the purged slot");
    }
}
