//! Counting window (§4.4.3): per-group fixed-count batches, no watermark.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{EngineError, Result};
use crate::types::{Row, TimeCharacteristic, WindowConfig, WindowKind};

use super::{group_key, Callback, Window};

pub struct CountingWindow {
    threshold: usize,
    config: WindowConfig,
    buffers: Mutex<HashMap<String, Vec<Row>>>,
    callback: Mutex<Option<Callback>>,
    output_tx: mpsc::Sender<Vec<Row>>,
    output_rx: Mutex<Option<mpsc::Receiver<Vec<Row>>>>,
    stopped: AtomicBool,
}

impl CountingWindow {
    pub fn new(config: WindowConfig, output_capacity: usize) -> Result<Self> {
        let threshold = match config.kind {
            WindowKind::Counting { threshold } => threshold,
            _ => return Err(EngineError::config("CountingWindow requires a Counting WindowKind")),
        };
        if threshold == 0 {
            return Err(EngineError::config("CountingWindow threshold must be > 0"));
        }
        if config.time_characteristic == TimeCharacteristic::EventTime {
            return Err(EngineError::config("CountingWindow does not support event-time semantics"));
        }
        let (output_tx, output_rx) = mpsc::channel(output_capacity.max(1));
        Ok(CountingWindow {
            threshold,
            config,
            buffers: Mutex::new(HashMap::new()),
            callback: Mutex::new(None),
            output_tx,
            output_rx: Mutex::new(Some(output_rx)),
            stopped: AtomicBool::new(false),
        })
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
impl Window for CountingWindow {
    fn add(&self, row: Row) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let key = group_key(&row.data, &self.config.group_by_key);
        let full = {
            let mut buffers = self.buffers.lock();
            let buf = buffers.entry(key).or_default();
            buf.push(row);
            if buf.len() >= self.threshold {
                Some(std::mem::take(buf))
            } else {
                None
            }
        };
        if let Some(batch) = full {
            self.emit_rows(batch);
        }
    }

    async fn start(self: Arc<Self>) {
        // count-driven; no background timer (§4.4.3).
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn trigger(&self) {
        let drained: Vec<Vec<Row>> = {
            let mut buffers = self.buffers.lock();
            let batches = buffers.values_mut().map(std::mem::take).filter(|b: &Vec<Row>| !b.is_empty()).collect();
            buffers.clear();
            batches
        };
        for rows in drained {
            self.emit_rows(rows);
        }
    }

    fn reset(&self) {
        self.buffers.lock().clear();
    }

    fn set_callback(&self, cb: Callback) {
        *self.callback.lock() = Some(cb);
    }

    fn take_output(&self) -> mpsc::Receiver<Vec<Row>> {
        self.output_rx.lock().take().expect("counting window output already taken")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NestedValue;
    use std::collections::HashMap as StdHashMap;
    use std::time::Instant;

    fn row_with_key(key: &str) -> Row {
        let mut m = StdHashMap::new();
        m.insert("k".to_string(), NestedValue::String(key.to_string()));
        Row::new(NestedValue::Map(m), Instant::now())
    }

    #[test]
    fn emits_exactly_threshold_rows_per_group() {
        let config = WindowConfig {
            kind: WindowKind::Counting { threshold: 3 },
            group_by_key: vec!["k".to_string()],
            ..Default::default()
        };
        let window = CountingWindow::new(config, 8).unwrap();
        let mut rx = window.take_output();
        window.add(row_with_key("A"));
        window.add(row_with_key("B"));
        window.add(row_with_key("A"));
        window.add(row_with_key("A"));
        let batch = rx.try_recv().expect("group A should have triggered at threshold 3");
        assert_eq!(batch.len(), 3);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn zero_threshold_is_config_error() {
        let config = WindowConfig { kind: WindowKind::Counting { threshold: 0 }, ..Default::default() };
        assert!(CountingWindow::new(config, 8).is_err());
    }

    #[test]
    fn event_time_is_rejected() {
        let config = WindowConfig {
            kind: WindowKind::Counting { threshold: 1 },
            time_characteristic: TimeCharacteristic::EventTime,
            ..Default::default()
        };
        assert!(CountingWindow::new(config, 8).is_err());
    }
}
