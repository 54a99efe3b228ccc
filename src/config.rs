//! `PerformanceConfig` (§5, §6, §9.3): buffer sizing, overflow policy, worker
//! pool sizing, and monitoring thresholds, plus the five named presets.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BufferConfig {
    pub data_channel_size: usize,
    pub result_channel_size: usize,
    pub window_output_size: usize,
    pub max_buffer_size: usize,
    pub usage_threshold: f64,
    pub enable_dynamic_resize: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            data_channel_size: 1024,
            result_channel_size: 1024,
            window_output_size: 256,
            max_buffer_size: 65536,
            usage_threshold: 0.8,
            enable_dynamic_resize: true,
        }
    }
}

/// Backpressure strategy applied when a bounded channel is full (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    Drop,
    Block,
    Expand,
    Persist,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExpansionConfig {
    pub growth_factor: f64,
    pub min_increment: usize,
    pub trigger_threshold: f64,
    pub expansion_timeout: Duration,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        ExpansionConfig {
            growth_factor: 2.0,
            min_increment: 128,
            trigger_threshold: 0.8,
            expansion_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OverflowConfig {
    pub strategy: OverflowStrategy,
    pub block_timeout: Duration,
    pub allow_data_loss: bool,
    pub expansion_config: ExpansionConfig,
    /// Spool directory for the `Persist` strategy (§5); the spool itself is
    /// an external collaborator (§1 Non-goals) — this only names where it
    /// would write.
    pub persist_data_dir: Option<String>,
    pub persist_max_file_size: u64,
    pub persist_flush_interval: Duration,
}

impl Default for OverflowConfig {
    fn default() -> Self {
        OverflowConfig {
            strategy: OverflowStrategy::Expand,
            block_timeout: Duration::from_millis(100),
            allow_data_loss: true,
            expansion_config: ExpansionConfig::default(),
            persist_data_dir: None,
            persist_max_file_size: 64 * 1024 * 1024,
            persist_flush_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    pub sink_pool_size: usize,
    pub sink_worker_count: usize,
    pub max_retry_routines: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig { sink_pool_size: 256, sink_worker_count: num_cpus::get().max(1), max_retry_routines: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WarningThresholds {
    pub drop_rate_warning: f64,
    pub drop_rate_critical: f64,
    pub buffer_usage_warning: f64,
    pub buffer_usage_critical: f64,
}

impl Default for WarningThresholds {
    fn default() -> Self {
        WarningThresholds {
            drop_rate_warning: 0.01,
            drop_rate_critical: 0.1,
            buffer_usage_warning: 0.7,
            buffer_usage_critical: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MonitoringConfig {
    pub enable_monitoring: bool,
    pub stats_update_interval: Duration,
    pub enable_detailed_stats: bool,
    pub warning_thresholds: WarningThresholds,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            enable_monitoring: true,
            stats_update_interval: Duration::from_secs(5),
            enable_detailed_stats: false,
            warning_thresholds: WarningThresholds::default(),
        }
    }
}

/// The performance/resource tuning surface passed into `Engine::new` (§6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PerformanceConfig {
    pub buffer_config: BufferConfig,
    pub overflow_config: OverflowConfig,
    pub worker_config: WorkerConfig,
    pub monitoring_config: MonitoringConfig,
}

impl PerformanceConfig {
    /// Load a `PerformanceConfig` from a TOML file, mirroring the donor's
    /// `Config::load` associated function (§9.3).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Balanced defaults suitable for most workloads.
    pub fn default_preset() -> Self {
        PerformanceConfig::default()
    }

    /// Large buffers and a wide worker pool, tolerant of bursty ingestion.
    pub fn high_performance() -> Self {
        PerformanceConfig {
            buffer_config: BufferConfig {
                data_channel_size: 8192,
                result_channel_size: 8192,
                window_output_size: 2048,
                max_buffer_size: 1 << 20,
                ..BufferConfig::default()
            },
            overflow_config: OverflowConfig { strategy: OverflowStrategy::Expand, ..OverflowConfig::default() },
            worker_config: WorkerConfig {
                sink_pool_size: 1024,
                sink_worker_count: (num_cpus::get() * 2).max(2),
                ..WorkerConfig::default()
            },
            monitoring_config: MonitoringConfig::default(),
        }
    }

    /// Small buffers, immediate backpressure — minimizes queueing delay at
    /// the cost of dropping under sustained overload.
    pub fn low_latency() -> Self {
        PerformanceConfig {
            buffer_config: BufferConfig {
                data_channel_size: 64,
                result_channel_size: 64,
                window_output_size: 32,
                ..BufferConfig::default()
            },
            overflow_config: OverflowConfig {
                strategy: OverflowStrategy::Drop,
                block_timeout: Duration::from_millis(5),
                ..OverflowConfig::default()
            },
            worker_config: WorkerConfig::default(),
            monitoring_config: MonitoringConfig::default(),
        }
    }

    /// Blocks rather than drops; used where losing records is unacceptable
    /// and upstream backpressure is preferred to silent loss.
    pub fn zero_data_loss() -> Self {
        PerformanceConfig {
            buffer_config: BufferConfig { enable_dynamic_resize: false, ..BufferConfig::default() },
            overflow_config: OverflowConfig {
                strategy: OverflowStrategy::Block,
                block_timeout: Duration::from_secs(5),
                allow_data_loss: false,
                ..OverflowConfig::default()
            },
            worker_config: WorkerConfig::default(),
            monitoring_config: MonitoringConfig { enable_detailed_stats: true, ..MonitoringConfig::default() },
        }
    }

    /// Routes overflow to the external persistence sink interface (§5)
    /// instead of dropping or blocking.
    pub fn persistence() -> Self {
        PerformanceConfig {
            buffer_config: BufferConfig::default(),
            overflow_config: OverflowConfig {
                strategy: OverflowStrategy::Persist,
                allow_data_loss: false,
                persist_data_dir: Some("./streamql-spool".to_string()),
                ..OverflowConfig::default()
            },
            worker_config: WorkerConfig::default(),
            monitoring_config: MonitoringConfig { enable_detailed_stats: true, ..MonitoringConfig::default() },
        }
    }
}

/// Named preset selector mirrored by `EngineOptions::performance_mode` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceMode {
    Default,
    HighPerformance,
    LowLatency,
    ZeroDataLoss,
    Persistence,
    Custom,
}

impl PerformanceMode {
    pub fn resolve(self, custom: Option<PerformanceConfig>) -> PerformanceConfig {
        match self {
            PerformanceMode::Default => PerformanceConfig::default_preset(),
            PerformanceMode::HighPerformance => PerformanceConfig::high_performance(),
            PerformanceMode::LowLatency => PerformanceConfig::low_latency(),
            PerformanceMode::ZeroDataLoss => PerformanceConfig::zero_data_loss(),
            PerformanceMode::Persistence => PerformanceConfig::persistence(),
            PerformanceMode::Custom => custom.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_preset_uses_expand_strategy() {
        let cfg = PerformanceConfig::default_preset();
        assert_eq!(cfg.overflow_config.strategy, OverflowStrategy::Expand);
    }

    #[test]
    fn zero_data_loss_never_drops() {
        let cfg = PerformanceConfig::zero_data_loss();
        assert_eq!(cfg.overflow_config.strategy, OverflowStrategy::Block);
        assert!(!cfg.overflow_config.allow_data_loss);
    }

    #[test]
    fn custom_mode_falls_back_to_default_without_override() {
        let cfg = PerformanceMode::Custom.resolve(None);
        assert_eq!(cfg.buffer_config.data_channel_size, BufferConfig::default().data_channel_size);
    }

    #[test]
    fn toml_round_trip() {
        let cfg = PerformanceConfig::high_performance();
        let text = toml::to_string(&cfg).unwrap();
        let back: PerformanceConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.buffer_config.data_channel_size, cfg.buffer_config.data_channel_size);
    }

    #[test]
    fn load_reads_and_parses_a_toml_file() {
        let cfg = PerformanceConfig::high_performance();
        let text = toml::to_string(&cfg).unwrap();
        let path = std::env::temp_dir().join(format!("streamql-config-test-{:?}.toml", std::thread::current().id()));
        std::fs::write(&path, text).unwrap();

        let loaded = PerformanceConfig::load(&path).unwrap();
        assert_eq!(loaded.buffer_config.data_channel_size, cfg.buffer_config.data_channel_size);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn load_surfaces_io_error_for_missing_file() {
        let result = PerformanceConfig::load("/nonexistent/streamql-config.toml");
        assert!(result.is_err());
    }
}
