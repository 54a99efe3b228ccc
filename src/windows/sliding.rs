//! Sliding window (§4.4.2): fixed-size windows advancing by a smaller slide.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{EngineError, Result};
use crate::types::{Row, TimeSlot, WindowConfig, WindowKind};

use super::{Callback, Window};

pub struct SlidingWindow {
    size: Duration,
    slide: Duration,
    rows: Mutex<Vec<Row>>,
    current_slot: Mutex<Option<TimeSlot>>,
    first_row_at: Mutex<Option<Instant>>,
    callback: Mutex<Option<Callback>>,
    output_tx: mpsc::Sender<Vec<Row>>,
    output_rx: Mutex<Option<mpsc::Receiver<Vec<Row>>>>,
    stopped: AtomicBool,
}

impl SlidingWindow {
    pub fn new(config: WindowConfig, output_capacity: usize) -> Result<Self> {
        let (size, slide) = match config.kind {
            WindowKind::Sliding { size, slide } => (size, slide),
            _ => return Err(EngineError::config("SlidingWindow requires a Sliding WindowKind")),
        };
        if slide.is_zero() || slide > size {
            return Err(EngineError::config("sliding window slide must be > 0 and <= size"));
        }
        let (output_tx, output_rx) = mpsc::channel(output_capacity.max(1));
        Ok(SlidingWindow {
            size,
            slide,
            rows: Mutex::new(Vec::new()),
            current_slot: Mutex::new(None),
            first_row_at: Mutex::new(None),
            callback: Mutex::new(None),
            output_tx,
            output_rx: Mutex::new(Some(output_rx)),
            stopped: AtomicBool::new(false),
        })
    }

    fn slide_tick(&self) {
        let first = *self.first_row_at.lock();
        let Some(first) = first else { return };
        let mut slot_guard = self.current_slot.lock();
        let slot = *slot_guard.get_or_insert_with(|| TimeSlot::new(first, first + self.size));

        let mut rows = self.rows.lock();
        let snapshot: Vec<Row> =
            rows.iter().filter(|r| slot.contains(r.timestamp)).cloned().map(|r| r.with_slot(slot)).collect();

        let new_start = slot.start + self.slide;
        *slot_guard = Some(TimeSlot::new(new_start, new_start + self.size));
        rows.retain(|r| r.timestamp >= new_start);
        drop(rows);
        drop(slot_guard);

        self.emit_rows(snapshot);
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
impl Window for SlidingWindow {
    fn add(&self, row: Row) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.first_row_at.lock().get_or_insert(row.timestamp);
        self.rows.lock().push(row);
    }

    async fn start(self: Arc<Self>) {
        // the first window only closes once `size` has elapsed from the
        // first observed row; subsequent boundaries advance every `slide`.
        loop {
            {
                let have_data = self.first_row_at.lock().is_some();
                if have_data {
                    break;
                }
            }
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(self.size).await;
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.slide_tick();
        let mut ticker = tokio::time::interval(self.slide.max(Duration::from_millis(1)));
        loop {
            ticker.tick().await;
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            self.slide_tick();
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn trigger(&self) {
        self.slide_tick();
    }

    fn reset(&self) {
        self.rows.lock().clear();
        *self.current_slot.lock() = None;
        *self.first_row_at.lock() = None;
    }

    fn set_callback(&self, cb: Callback) {
        *self.callback.lock() = Some(cb);
    }

    fn take_output(&self) -> mpsc::Receiver<Vec<Row>> {
        self.output_rx.lock().take().expect("sliding window output already taken")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NestedValue;

    #[test]
    fn retains_rows_that_may_still_belong_to_a_future_window() {
        let config = WindowConfig {
            kind: WindowKind::Sliding { size: Duration::from_secs(10), slide: Duration::from_secs(5) },
            ..Default::default()
        };
        let window = SlidingWindow::new(config, 8).unwrap();
        let t0 = Instant::now();
        window.add(Row::new(NestedValue::Null, t0));
        window.trigger();
        // with no explicit slot advance beyond the first snapshot, the row
        // should still be present for the next window
        assert_eq!(window.rows.lock().len(), 1);
    }

    #[test]
    fn rejects_slide_greater_than_size() {
        let config = WindowConfig {
            kind: WindowKind::Sliding { size: Duration::from_secs(1), slide: Duration::from_secs(2) },
            ..Default::default()
        };
        assert!(SlidingWindow::new(config, 8).is_err());
    }
}
