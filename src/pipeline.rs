//! Pipeline runtime (§4.6): the `Engine` state machine, its transports, and
//! the public API surface (§6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::config::{OverflowStrategy, PerformanceConfig, PerformanceMode};
use crate::error::{EngineError, Result};
use crate::expr::CompiledExpr;
use crate::function_registry::FunctionRegistry;
use crate::types::{NestedValue, OutputRow, Row, StreamConfig};
use crate::windows::{self, Window};

/// A registered sink callback (§4.6/§6): invoked with each output batch,
/// converted to plain JSON maps in `field_order`.
pub type SinkFn = Arc<dyn Fn(Vec<serde_json::Map<String, serde_json::Value>>) + Send + Sync>;

/// Options accepted by [`Engine::new`] (§6). Later `with_*` calls override
/// earlier ones, mirroring the donor's config-layering convention.
#[derive(Clone)]
pub struct EngineOptions {
    pub data_channel_size: Option<usize>,
    pub result_channel_size: Option<usize>,
    pub sink_pool_size: Option<usize>,
    pub performance_mode: PerformanceMode,
    pub custom_performance_config: Option<PerformanceConfig>,
    pub overflow_strategy: Option<OverflowStrategy>,
    pub block_timeout: Option<Duration>,
    pub persist_data_dir: Option<String>,
    pub persist_max_file_size: Option<u64>,
    pub persist_flush_interval: Option<Duration>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            data_channel_size: None,
            result_channel_size: None,
            sink_pool_size: None,
            performance_mode: PerformanceMode::Default,
            custom_performance_config: None,
            overflow_strategy: None,
            block_timeout: None,
            persist_data_dir: None,
            persist_max_file_size: None,
            persist_flush_interval: None,
        }
    }
}

impl EngineOptions {
    pub fn with_performance_mode(mut self, mode: PerformanceMode) -> Self {
        self.performance_mode = mode;
        self
    }

    pub fn with_custom_performance_config(mut self, config: PerformanceConfig) -> Self {
        self.custom_performance_config = Some(config);
        self.performance_mode = PerformanceMode::Custom;
        self
    }

    /// Load a `PerformanceConfig` from a TOML file and use it in place of a
    /// named preset (§9.3).
    pub fn with_performance_config_path<P: AsRef<std::path::Path>>(self, path: P) -> Result<Self> {
        let config = PerformanceConfig::load(path)?;
        Ok(self.with_custom_performance_config(config))
    }

    pub fn with_buffer_sizes(mut self, data: usize, result: usize, sink_pool: usize) -> Self {
        self.data_channel_size = Some(data);
        self.result_channel_size = Some(result);
        self.sink_pool_size = Some(sink_pool);
        self
    }

    pub fn with_overflow_strategy(mut self, strategy: OverflowStrategy) -> Self {
        self.overflow_strategy = Some(strategy);
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = Some(timeout);
        self
    }

    pub fn with_persist(mut self, data_dir: impl Into<String>, max_file_size: u64, flush_interval: Duration) -> Self {
        self.persist_data_dir = Some(data_dir.into());
        self.persist_max_file_size = Some(max_file_size);
        self.persist_flush_interval = Some(flush_interval);
        self
    }

    /// Resolve the final `PerformanceConfig`, applying option overrides on
    /// top of the selected preset (§6 "later options override earlier").
    fn resolve_performance_config(&self) -> PerformanceConfig {
        let mut config = self.performance_mode.resolve(self.custom_performance_config.clone());
        if let Some(d) = self.data_channel_size {
            config.buffer_config.data_channel_size = d;
        }
        if let Some(r) = self.result_channel_size {
            config.buffer_config.result_channel_size = r;
        }
        if let Some(s) = self.sink_pool_size {
            config.worker_config.sink_pool_size = s;
        }
        if let Some(strategy) = self.overflow_strategy {
            config.overflow_config.strategy = strategy;
        }
        if let Some(timeout) = self.block_timeout {
            config.overflow_config.block_timeout = timeout;
        }
        if let Some(dir) = &self.persist_data_dir {
            config.overflow_config.persist_data_dir = Some(dir.clone());
        }
        if let Some(size) = self.persist_max_file_size {
            config.overflow_config.persist_max_file_size = size;
        }
        if let Some(interval) = self.persist_flush_interval {
            config.overflow_config.persist_flush_interval = interval;
        }
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Created,
    Executing,
    Stopped,
}

/// Atomic counters backing `get_stats`/`get_detailed_stats` (§5, §7).
#[derive(Default)]
struct EngineStats {
    input_count: AtomicU64,
    output_count: AtomicU64,
    dropped_count: AtomicU64,
    filtered_count: AtomicU64,
    persisted_count: AtomicU64,
    sink_error_count: AtomicU64,
    last_window_sent: AtomicI64,
}

/// The compiled, running query (§4.6). Populated once by `execute`.
struct RunningQuery {
    stream_config: StreamConfig,
    where_expr: Option<CompiledExpr>,
    aggregator: Arc<Aggregator>,
    window: Option<Arc<dyn Window>>,
}

/// Everything a spawned background task needs, cloned as one `Arc` rather
/// than threading the whole `Engine` through every closure.
struct Shared {
    registry: Arc<FunctionRegistry>,
    performance_config: PerformanceConfig,
    data_tx: mpsc::Sender<NestedValue>,
    result_tx: mpsc::Sender<Vec<OutputRow>>,
    sinks: RwLock<Vec<SinkFn>>,
    external_channels: RwLock<Vec<mpsc::Sender<Vec<serde_json::Map<String, serde_json::Value>>>>>,
    sink_permits: Arc<Semaphore>,
    overflow_buffer: Mutex<std::collections::VecDeque<NestedValue>>,
    cancel: CancellationToken,
    stats: EngineStats,
}

impl Shared {
    async fn process_record(&self, query: &RunningQuery, record: NestedValue) {
        if let Some(where_expr) = &query.where_expr {
            if !where_expr.eval_bool(&record, &self.registry) {
                self.stats.filtered_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        if let Some(window) = &query.window {
            let now = Instant::now();
            let ts = query
                .stream_config
                .window_config
                .as_ref()
                .map(|cfg| windows::extract_timestamp(&record, cfg, now))
                .unwrap_or(now);
            window.add(Row::new(record, ts));
            return;
        }

        let rows = query.aggregator.reduce(vec![Row::new(record, Instant::now())]);
        if rows.is_empty() {
            return;
        }
        self.stats.output_count.fetch_add(rows.len() as u64, Ordering::Relaxed);
        if self.result_tx.send(rows).await.is_err() {
            warn!("result channel closed while delivering non-windowed output");
        }
    }

    async fn persist_record(&self, dir: &str, record: &NestedValue) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        tokio::fs::create_dir_all(dir).await?;
        let path = std::path::Path::new(dir).join("spool.jsonl");
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        let line = serde_json::to_string(&serde_json::Value::from(record.clone()))?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }
}

/// Fan out one output batch to every registered external channel and sink
/// (§4.6, §6). Free function over `&Arc<Shared>` since it spawns tasks that
/// outlive the call — an `Arc<Self>` method receiver isn't available on
/// stable Rust.
async fn dispatch_batch(shared: &Arc<Shared>, batch: Vec<OutputRow>) {
    let json_batch: Vec<serde_json::Map<String, serde_json::Value>> = batch.iter().map(OutputRow::to_json_map).collect();

    for tx in shared.external_channels.read().iter() {
        let _ = tx.try_send(json_batch.clone());
    }

    let sinks = shared.sinks.read().clone();
    for sink in sinks {
        let permit = match shared.sink_permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => continue,
        };
        let batch = json_batch.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink(batch)));
            if result.is_err() {
                shared.stats.sink_error_count.fetch_add(1, Ordering::Relaxed);
                error!("sink callback panicked");
            }
        });
    }
}

/// Apply `overflow_config.strategy` (§5 table) to a record that didn't fit
/// the bounded data channel.
fn handle_overflow(shared: &Arc<Shared>, record: NestedValue) {
    match shared.performance_config.overflow_config.strategy {
        OverflowStrategy::Drop => {
            shared.stats.dropped_count.fetch_add(1, Ordering::Relaxed);
        }
        OverflowStrategy::Block => {
            let shared = shared.clone();
            let timeout = shared.performance_config.overflow_config.block_timeout;
            tokio::spawn(async move {
                let send = shared.data_tx.send(record);
                if tokio::time::timeout(timeout, send).await.is_err() {
                    shared.stats.dropped_count.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
        OverflowStrategy::Expand => {
            let mut overflow = shared.overflow_buffer.lock();
            if overflow.len() < shared.performance_config.buffer_config.max_buffer_size {
                overflow.push_back(record);
                drop(overflow);
                spawn_overflow_drain(shared);
            } else {
                shared.stats.dropped_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        OverflowStrategy::Persist => {
            spawn_persist(shared, record);
        }
    }
}

/// Best-effort drain of the expansion overflow queue back into the bounded
/// channel as space frees up.
fn spawn_overflow_drain(shared: &Arc<Shared>) {
    let shared = shared.clone();
    tokio::spawn(async move {
        loop {
            let next = shared.overflow_buffer.lock().pop_front();
            let Some(record) = next else { break };
            match shared.data_tx.try_send(record) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Full(record)) => {
                    shared.overflow_buffer.lock().push_front(record);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    });
}

fn spawn_persist(shared: &Arc<Shared>, record: NestedValue) {
    let Some(dir) = shared.performance_config.overflow_config.persist_data_dir.clone() else {
        shared.stats.dropped_count.fetch_add(1, Ordering::Relaxed);
        return;
    };
    let shared = shared.clone();
    tokio::spawn(async move {
        if let Err(e) = shared.persist_record(&dir, &record).await {
            warn!("persist spool write failed, falling over to drop: {}", e);
            shared.stats.dropped_count.fetch_add(1, Ordering::Relaxed);
        } else {
            shared.stats.persisted_count.fetch_add(1, Ordering::Relaxed);
        }
    });
}

/// Owns the component graph and transports for a single compiled query
/// (§4.6): `Created -> Executing -> Stopped`, one-shot `execute`.
pub struct Engine {
    options: EngineOptions,
    shared: Arc<Shared>,
    state: Mutex<EngineState>,
    query: RwLock<Option<Arc<RunningQuery>>>,
    data_rx: Mutex<Option<mpsc::Receiver<NestedValue>>>,
    result_rx: Mutex<Option<mpsc::Receiver<Vec<OutputRow>>>>,
    start_time: Instant,
}

impl Engine {
    /// Construct an idle engine. Options are merged into one
    /// `PerformanceConfig`; transports are sized from it immediately so
    /// `emit` can be called as soon as `execute` returns.
    pub fn new(options: EngineOptions) -> Self {
        let performance_config = options.resolve_performance_config();
        let (data_tx, data_rx) = mpsc::channel(performance_config.buffer_config.data_channel_size.max(1));
        let (result_tx, result_rx) = mpsc::channel(performance_config.buffer_config.result_channel_size.max(1));
        let sink_permits = Arc::new(Semaphore::new(performance_config.worker_config.sink_worker_count.max(1)));
        info!("engine created with performance mode {:?}", options.performance_mode);

        let shared = Arc::new(Shared {
            registry: Arc::new(FunctionRegistry::new()),
            performance_config,
            data_tx,
            result_tx,
            sinks: RwLock::new(Vec::new()),
            external_channels: RwLock::new(Vec::new()),
            sink_permits,
            overflow_buffer: Mutex::new(std::collections::VecDeque::new()),
            cancel: CancellationToken::new(),
            stats: EngineStats::default(),
        });

        Engine {
            options,
            shared,
            state: Mutex::new(EngineState::Created),
            query: RwLock::new(None),
            data_rx: Mutex::new(Some(data_rx)),
            result_rx: Mutex::new(Some(result_rx)),
            start_time: Instant::now(),
        }
    }

    /// Compile `sql` into a [`StreamConfig`], build the component graph, and
    /// spawn its workers. One-shot: a second call fails with `StateError`.
    pub fn execute(&self, sql: &str) -> Result<()> {
        self.mark_executing()?;
        let stream_config = crate::sql::compile(sql, &self.shared.registry)?;
        self.build_and_spawn(stream_config)
    }

    /// Start directly from an already-compiled [`StreamConfig`], bypassing
    /// the SQL surface entirely. Same one-shot rules as `execute`.
    pub fn execute_config(&self, stream_config: StreamConfig) -> Result<()> {
        self.mark_executing()?;
        self.build_and_spawn(stream_config)
    }

    fn mark_executing(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != EngineState::Created {
            return Err(EngineError::state("execute called more than once"));
        }
        *state = EngineState::Executing;
        Ok(())
    }

    fn build_and_spawn(&self, stream_config: StreamConfig) -> Result<()> {
        let where_expr = match &stream_config.where_clause {
            Some(src) => Some(CompiledExpr::compile(src, &self.shared.registry)?),
            None => None,
        };
        let aggregator = Arc::new(Aggregator::new(stream_config.clone(), self.shared.registry.clone())?);

        let window = if stream_config.need_window {
            let window_config = stream_config
                .window_config
                .clone()
                .ok_or_else(|| EngineError::config("need_window is set but window_config is absent"))?;
            Some(windows::build_window(
                window_config,
                self.shared.performance_config.buffer_config.window_output_size,
            )?)
        } else {
            None
        };

        let running = Arc::new(RunningQuery { stream_config, where_expr, aggregator, window: window.clone() });
        *self.query.write() = Some(running.clone());

        let data_rx = self.data_rx.lock().take().ok_or_else(|| EngineError::internal("data receiver already taken"))?;
        let result_rx =
            self.result_rx.lock().take().ok_or_else(|| EngineError::internal("result receiver already taken"))?;

        self.spawn_worker(data_rx, running.clone());
        self.spawn_sink_dispatch(result_rx);

        if let Some(window) = window {
            self.spawn_window(window, running);
        }

        info!("engine executing");
        Ok(())
    }

    fn spawn_worker(&self, mut data_rx: mpsc::Receiver<NestedValue>, query: Arc<RunningQuery>) {
        let shared = self.shared.clone();
        let cancel = self.shared.cancel.clone();
        tokio::spawn(async move {
            loop {
                let record = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = data_rx.recv() => r,
                };
                let Some(record) = record else { break };
                shared.process_record(&query, record).await;
            }
            debug!("worker loop terminated");
        });
    }

    fn spawn_window(&self, window: Arc<dyn Window>, query: Arc<RunningQuery>) {
        let cancel = self.shared.cancel.clone();
        let window_for_start = window.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = window_for_start.start() => {}
            }
        });

        let mut output = window.take_output();
        let shared = self.shared.clone();
        let cancel = self.shared.cancel.clone();
        tokio::spawn(async move {
            loop {
                let batch = tokio::select! {
                    _ = cancel.cancelled() => break,
                    b = output.recv() => b,
                };
                let Some(batch) = batch else { break };
                let rows = query.aggregator.reduce(batch);
                if rows.is_empty() {
                    continue;
                }
                shared.stats.output_count.fetch_add(rows.len() as u64, Ordering::Relaxed);
                shared.stats.last_window_sent.store(rows.len() as i64, Ordering::Relaxed);
                if shared.result_tx.send(rows).await.is_err() {
                    warn!("result channel closed while delivering windowed output");
                    break;
                }
            }
            debug!("aggregator loop terminated");
        });
    }

    fn spawn_sink_dispatch(&self, mut result_rx: mpsc::Receiver<Vec<OutputRow>>) {
        let shared = self.shared.clone();
        let cancel = self.shared.cancel.clone();
        tokio::spawn(async move {
            loop {
                let batch = tokio::select! {
                    _ = cancel.cancelled() => break,
                    b = result_rx.recv() => b,
                };
                let Some(batch) = batch else { break };
                dispatch_batch(&shared, batch).await;
            }
            debug!("sink dispatch loop terminated");
        });
    }

    /// Push one record; returns immediately. Honors `overflow_config.strategy`
    /// (§5). A no-op (besides counting) once the engine is stopped.
    pub fn emit(&self, record: NestedValue) {
        if *self.state.lock() == EngineState::Stopped {
            return;
        }
        match self.shared.data_tx.try_send(record) {
            Ok(()) => {
                self.shared.stats.input_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(record)) => handle_overflow(&self.shared, record),
        }
    }

    /// Synchronous, non-aggregate path (§4.6, §6 invariant 4): evaluates
    /// WHERE and the projection inline, bypassing every channel. Fails if the
    /// compiled query requires windowing.
    pub fn emit_sync(&self, record: NestedValue) -> Result<Option<OutputRow>> {
        let query = self.query.read().clone().ok_or_else(|| EngineError::state("emit_sync before execute"))?;
        if query.window.is_some() {
            return Err(EngineError::state("emit_sync is not supported for windowed/aggregate queries"));
        }
        if let Some(where_expr) = &query.where_expr {
            if !where_expr.eval_bool(&record, &self.shared.registry) {
                return Ok(None);
            }
        }
        let mut rows = query.aggregator.reduce(vec![Row::new(record, Instant::now())]);
        Ok(rows.pop())
    }

    /// Register a consumer invoked with every future output batch (§6).
    pub fn add_sink(&self, sink: SinkFn) {
        self.shared.sinks.write().push(sink);
    }

    /// Obtain a fresh bounded receiver fed the same batches sinks receive.
    pub fn to_channel(&self) -> mpsc::Receiver<Vec<serde_json::Map<String, serde_json::Value>>> {
        let (tx, rx) = mpsc::channel(self.shared.performance_config.buffer_config.result_channel_size.max(1));
        self.shared.external_channels.write().push(tx);
        rx
    }

    /// Coarse counters (§6).
    pub fn get_stats(&self) -> HashMap<String, i64> {
        let stats = &self.shared.stats;
        let mut out = HashMap::new();
        out.insert("input_count".to_string(), stats.input_count.load(Ordering::Relaxed) as i64);
        out.insert("output_count".to_string(), stats.output_count.load(Ordering::Relaxed) as i64);
        out.insert("dropped_count".to_string(), stats.dropped_count.load(Ordering::Relaxed) as i64);
        out.insert("filtered_count".to_string(), stats.filtered_count.load(Ordering::Relaxed) as i64);
        out
    }

    /// Everything in `get_stats` plus engine state, uptime, and per-strategy
    /// detail (§6).
    pub fn get_detailed_stats(&self) -> HashMap<String, serde_json::Value> {
        let stats = &self.shared.stats;
        let mut out: HashMap<String, serde_json::Value> = HashMap::new();
        for (k, v) in self.get_stats() {
            out.insert(k, serde_json::Value::from(v));
        }
        out.insert("persisted_count".to_string(), stats.persisted_count.load(Ordering::Relaxed).into());
        out.insert("sink_error_count".to_string(), stats.sink_error_count.load(Ordering::Relaxed).into());
        out.insert("last_window_batch_size".to_string(), stats.last_window_sent.load(Ordering::Relaxed).into());
        out.insert("uptime_seconds".to_string(), self.start_time.elapsed().as_secs().into());
        out.insert("state".to_string(), format!("{:?}", *self.state.lock()).into());
        out.insert(
            "overflow_buffer_len".to_string(),
            serde_json::Value::from(self.shared.overflow_buffer.lock().len() as i64),
        );
        out
    }

    /// Idempotent shutdown (§5, §6): cancels all background tasks. A second
    /// call is a no-op.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if *state == EngineState::Stopped {
            return;
        }
        *state = EngineState::Stopped;
        self.shared.cancel.cancel();
        info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn simple_config() -> StreamConfig {
        let mut select_fields = StdHashMap::new();
        select_fields.insert("n".to_string(), String::new());
        let mut field_alias = StdHashMap::new();
        field_alias.insert("n".to_string(), "name".to_string());
        StreamConfig {
            select_fields,
            field_alias,
            field_order: vec!["n".to_string()],
            need_window: false,
            ..Default::default()
        }
    }

    fn record(name: &str) -> NestedValue {
        let mut m = StdHashMap::new();
        m.insert("name".to_string(), NestedValue::String(name.to_string()));
        NestedValue::Map(m)
    }

    #[tokio::test]
    async fn emit_sync_projects_without_window() {
        let engine = Engine::new(EngineOptions::default().with_buffer_sizes(8, 8, 4));
        engine.execute_config(simple_config()).unwrap();
        let row = engine.emit_sync(record("alice")).unwrap().unwrap();
        assert_eq!(row.get("n"), Some(&NestedValue::String("alice".into())));
    }

    #[tokio::test]
    async fn second_execute_is_state_error() {
        let engine = Engine::new(EngineOptions::default());
        engine.execute_config(simple_config()).unwrap();
        assert!(engine.execute_config(simple_config()).is_err());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let engine = Engine::new(EngineOptions::default());
        engine.execute_config(simple_config()).unwrap();
        engine.stop();
        engine.stop();
    }

    #[tokio::test]
    async fn emit_then_drain_to_channel() {
        let engine = Engine::new(EngineOptions::default().with_buffer_sizes(8, 8, 4));
        let mut rx = engine.to_channel();
        engine.execute_config(simple_config()).unwrap();
        engine.emit(record("bob"));
        let batch = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(batch[0].get("n").unwrap(), &serde_json::Value::String("bob".to_string()));
    }

    #[test]
    fn performance_config_path_loads_and_applies_a_custom_preset() {
        let custom = PerformanceConfig::high_performance();
        let text = toml::to_string(&custom).unwrap();
        let path = std::env::temp_dir().join(format!("streamql-engine-options-test-{:?}.toml", std::thread::current().id()));
        std::fs::write(&path, text).unwrap();

        let options = EngineOptions::default().with_performance_config_path(&path).unwrap();
        assert_eq!(options.performance_mode, PerformanceMode::Custom);
        let resolved = options.resolve_performance_config();
        assert_eq!(resolved.buffer_config.data_channel_size, custom.buffer_config.data_channel_size);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn performance_config_path_propagates_io_error() {
        let result = EngineOptions::default().with_performance_config_path("/nonexistent/streamql-engine-options.toml");
        assert!(result.is_err());
    }
}
