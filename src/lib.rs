//! streamql
//!
//! An embeddable stream-SQL engine: compile a SQL-like query string into a
//! running data-flow pipeline, feed it a stream of loosely-typed nested
//! records, and receive aggregated result batches back.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────┐    ┌──────────────┐    ┌─────────┐    ┌─────────────┐
//! │ Ingress │───▶│ Filter/Proj. │───▶│ Window  │───▶│ Aggregator /│
//! │ Buffer  │    │   Worker(s)  │    │         │    │    Sinks    │
//! └─────────┘    └──────────────┘    └─────────┘    └─────────────┘
//!      │                 │                 │                │
//!      ▼                 ▼                 ▼                ▼
//!  bounded mpsc      `expr`/`field_   tumbling/sliding/  `aggregator`
//!  + backpressure     accessor`        counting/session   grouping,
//!  (§5)               (WHERE/SELECT)   (`windows`)         HAVING,
//!                                                           DISTINCT, LIMIT
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use streamql::pipeline::{Engine, EngineOptions};
//! use streamql::types::NestedValue;
//!
//! let engine = Engine::new(EngineOptions::default());
//! engine.execute("SELECT device.location AS loc FROM s WHERE sensor.temperature > 20").unwrap();
//! engine.add_sink(std::sync::Arc::new(|batch| {
//!     for row in batch {
//!         println!("{:?}", row);
//!     }
//! }));
//! engine.emit(NestedValue::Null);
//! engine.stop();
//! ```
//!
//! # Modules
//!
//! - [`types`] — `NestedValue`, `Row`, `TimeSlot`, `StreamConfig` (§3)
//! - [`error`] — `EngineError` and the crate's `Result` alias (§7)
//! - [`field_accessor`] — compiled, cached nested-path resolution (§4.1)
//! - [`function_registry`] — built-in and user-registered scalar/aggregate
//!   functions (§4.3)
//! - [`expr`] — the WHERE/HAVING/projection expression compiler and
//!   evaluator (§4.2)
//! - [`windows`] — tumbling, sliding, counting, and session windows plus the
//!   watermark generator (§4.4)
//! - [`aggregator`] — grouped incremental aggregation (§4.5)
//! - [`config`] — `PerformanceConfig` and its named presets (§6, §9.3)
//! - [`pipeline`] — the `Engine` runtime that wires the above into a running
//!   pipeline (§4.6)
//! - [`sql`] — a reference SQL-surface compiler that turns the grammar in
//!   §6 into a `StreamConfig` (§10); optional, a caller may build
//!   `StreamConfig` directly instead

pub mod aggregator;
pub mod config;
pub mod error;
pub mod expr;
pub mod field_accessor;
pub mod function_registry;
pub mod pipeline;
pub mod sql;
pub mod types;
pub mod windows;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Convenient re-exports for common call sites.
pub mod prelude {
    pub use crate::error::{EngineError, Result};
    pub use crate::pipeline::{Engine, EngineOptions};
    pub use crate::types::{NestedValue, OutputRow, Row, StreamConfig};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
        assert!(!NAME.is_empty());
    }
}
