//! Session window (§4.4.4): per-key windows closed by inactivity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{EngineError, Result};
use crate::types::{Row, TimeSlot, WindowConfig, WindowKind};

use super::{aligned_window_start, group_key, Callback, Window, PROCESS_EPOCH};

struct Session {
    slot: TimeSlot,
    rows: Vec<Row>,
}

pub struct SessionWindow {
    timeout: Duration,
    config: WindowConfig,
    sessions: Mutex<HashMap<String, Session>>,
    callback: Mutex<Option<Callback>>,
    output_tx: mpsc::Sender<Vec<Row>>,
    output_rx: Mutex<Option<mpsc::Receiver<Vec<Row>>>>,
    stopped: AtomicBool,
}

impl SessionWindow {
    pub fn new(config: WindowConfig, output_capacity: usize) -> Result<Self> {
        let timeout = match config.kind {
            WindowKind::Session { timeout } => timeout,
            _ => return Err(EngineError::config("SessionWindow requires a Session WindowKind")),
        };
        if timeout.is_zero() {
            return Err(EngineError::config("SessionWindow timeout must be > 0"));
        }
        let (output_tx, output_rx) = mpsc::channel(output_capacity.max(1));
        Ok(SessionWindow {
            timeout,
            config,
            sessions: Mutex::new(HashMap::new()),
            callback: Mutex::new(None),
            output_tx,
            output_rx: Mutex::new(Some(output_rx)),
            stopped: AtomicBool::new(false),
        })
    }

    fn close_expired(&self, now: Instant) {
        let expired: Vec<(String, Vec<Row>)> = {
            let mut sessions = self.sessions.lock();
            let keys: Vec<String> = sessions.iter().filter(|(_, s)| now >= s.slot.end).map(|(k, _)| k.clone()).collect();
            keys.into_iter().map(|k| (k.clone(), sessions.remove(&k).unwrap().rows)).collect()
        };
        for (_, rows) in expired {
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
impl Window for SessionWindow {
    fn add(&self, row: Row) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let key = group_key(&row.data, &self.config.group_by_key);
        let mut sessions = self.sessions.lock();
        let entry = sessions.entry(key).or_insert_with(|| {
            let start = aligned_window_start(row.timestamp, *PROCESS_EPOCH, self.timeout);
            Session { slot: TimeSlot::new(start, start + self.timeout), rows: Vec::new() }
        });
        let extended_end = (row.timestamp + self.timeout).max(entry.slot.end);
        entry.slot = TimeSlot::new(entry.slot.start, extended_end);
        entry.rows.push(row.with_slot(entry.slot));
    }

    async fn start(self: Arc<Self>) {
        let mut ticker = tokio::time::interval((self.timeout / 2).max(Duration::from_millis(1)));
        loop {
            ticker.tick().await;
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            self.close_expired(Instant::now());
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn trigger(&self) {
        let all: Vec<Vec<Row>> = {
            let mut sessions = self.sessions.lock();
            let batches = sessions.drain().map(|(_, s)| s.rows).collect();
            batches
        };
        for rows in all {
            self.emit_rows(rows);
        }
    }

    fn reset(&self) {
        self.sessions.lock().clear();
    }

    fn set_callback(&self, cb: Callback) {
        *self.callback.lock() = Some(cb);
    }

    fn take_output(&self) -> mpsc::Receiver<Vec<Row>> {
        self.output_rx.lock().take().expect("session window output already taken")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NestedValue;
    use std::collections::HashMap as StdHashMap;

    fn row_for_user(user: &str, ts: Instant) -> Row {
        let mut m = StdHashMap::new();
        m.insert("user_id".to_string(), NestedValue::String(user.to_string()));
        Row::new(NestedValue::Map(m), ts)
    }

    #[test]
    fn single_row_session_closes_and_emits_one_batch() {
        let config = WindowConfig {
            kind: WindowKind::Session { timeout: Duration::from_millis(50) },
            group_by_key: vec!["user_id".to_string()],
            ..Default::default()
        };
        let window = SessionWindow::new(config, 8).unwrap();
        let t0 = Instant::now();
        window.add(row_for_user("U", t0));
        assert_eq!(window.sessions.lock().len(), 1);
        window.close_expired(t0 + Duration::from_millis(60));
        assert_eq!(window.sessions.lock().len(), 0);
    }

    #[test]
    fn zero_timeout_is_config_error() {
        let config = WindowConfig { kind: WindowKind::Session { timeout: Duration::ZERO }, ..Default::default() };
        assert!(SessionWindow::new(config, 8).is_err());
    }
}
