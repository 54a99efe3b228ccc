//! Windowing (§4.4): four bucketing strategies behind one uniform interface,
//! plus the shared watermark tracker (§4.4.5).

pub mod counting;
pub mod session;
pub mod sliding;
pub mod tumbling;
pub mod watermark;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{NestedValue, Row, WindowConfig, WindowKind};

pub type Callback = Arc<dyn Fn(&[Row]) + Send + Sync>;

/// The uniform window interface (§4.4).
#[async_trait]
pub trait Window: Send + Sync {
    /// Accept a row. Non-blocking: buffering and emission happen internally.
    fn add(&self, row: Row);
    /// Begin background triggering.
    async fn start(self: Arc<Self>);
    /// Cancel background triggering. Safe to call multiple times.
    fn stop(&self);
    /// Force-emit current contents. Safe to call at any time.
    fn trigger(&self);
    /// Clear all buffered state.
    fn reset(&self);
    /// Install a synchronous per-batch callback invoked before enqueue.
    fn set_callback(&self, cb: Callback);
    /// Take the bounded output channel receiver. The engine does this exactly
    /// once when wiring the pipeline.
    fn take_output(&self) -> mpsc::Receiver<Vec<Row>>;
}

/// Fixed instant captured at first use, used as the absolute origin for
/// event-time epoch alignment (`aligned = (ts / size) * size`, §4.4.1):
/// integer epoch fields are mapped onto `Instant`s offset from this origin
/// rather than real UNIX time, since `Instant` has no wall-clock epoch.
pub static PROCESS_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Resolve a row's timestamp (§4.4): an explicit `ts_prop` path, accepting
/// integer epochs interpreted via `time_unit`; otherwise wall-clock "now".
pub fn extract_timestamp(row_data: &NestedValue, config: &WindowConfig, now: Instant) -> Instant {
    let Some(path) = &config.ts_prop else { return now };
    let Ok(compiled) = crate::field_accessor::CompiledPath::compile(path) else { return now };
    match compiled.resolve(row_data).as_i64() {
        Some(epoch) => *PROCESS_EPOCH + config.time_unit.to_duration(epoch),
        None => now,
    }
}

/// `aligned = epoch + floor((ts - epoch) / size) * size`.
pub fn aligned_window_start(ts: Instant, epoch: Instant, size: Duration) -> Instant {
    let elapsed = ts.saturating_duration_since(epoch).as_nanos();
    let size_ns = size.as_nanos().max(1);
    let aligned_ns = (elapsed / size_ns) * size_ns;
    epoch + Duration::from_nanos(aligned_ns as u64)
}

/// Group key formed from a row's data over `group_by_key` paths (§4.4.3,
/// §4.4.4): per-field canonical strings, delimited, matching the aggregator's
/// group-key convention (§4.5).
pub fn group_key(row_data: &NestedValue, group_by_key: &[String]) -> String {
    group_by_key
        .iter()
        .map(|path| {
            crate::field_accessor::CompiledPath::compile(path)
                .map(|p| p.resolve(row_data).to_canonical_string())
                .unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

/// Construct the concrete window implementation for a compiled `WindowConfig`.
pub fn build_window(config: WindowConfig, output_capacity: usize) -> Result<Arc<dyn Window>> {
    match &config.kind {
        WindowKind::Tumbling { .. } => Ok(Arc::new(tumbling::TumblingWindow::new(config, output_capacity)?)),
        WindowKind::Sliding { .. } => Ok(Arc::new(sliding::SlidingWindow::new(config, output_capacity)?)),
        WindowKind::Counting { .. } => Ok(Arc::new(counting::CountingWindow::new(config, output_capacity)?)),
        WindowKind::Session { .. } => Ok(Arc::new(session::SessionWindow::new(config, output_capacity)?)),
    }
}
