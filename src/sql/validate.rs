//! Semantic validation of an assembled `StreamConfig`, mirroring the donor's
//! separate validate-after-parse pass rather than folding every check into
//! the parser itself.

use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::types::{StreamConfig, TimeCharacteristic, WindowKind};

pub fn validate(config: &StreamConfig) -> Result<()> {
    if let Some(window) = &config.window_config {
        validate_window_params(&window.kind)?;
        if matches!(window.kind, WindowKind::Counting { .. }) && window.time_characteristic == TimeCharacteristic::EventTime {
            return Err(EngineError::config("CountingWindow does not support event-time (remove WITH (TIMESTAMP=...))"));
        }
    }

    for alias in &config.field_order {
        let has_alias = config.field_alias.contains_key(alias);
        let has_expr = config.field_expressions.contains_key(alias);
        if has_alias && has_expr {
            return Err(EngineError::internal(format!("alias '{}' has both a field_alias and a field_expressions entry", alias)));
        }
    }

    Ok(())
}

fn validate_window_params(kind: &WindowKind) -> Result<()> {
    match kind {
        WindowKind::Tumbling { size } => non_zero(*size, "TumblingWindow size"),
        WindowKind::Sliding { size, slide } => {
            non_zero(*size, "SlidingWindow size")?;
            non_zero(*slide, "SlidingWindow slide")
        }
        WindowKind::Counting { threshold } => {
            if *threshold == 0 {
                Err(EngineError::config("CountingWindow threshold must be greater than zero"))
            } else {
                Ok(())
            }
        }
        WindowKind::Session { timeout } => non_zero(*timeout, "SessionWindow timeout"),
    }
}

fn non_zero(d: Duration, what: &str) -> Result<()> {
    if d.is_zero() {
        Err(EngineError::config(format!("{} must be greater than zero", what)))
    } else {
        Ok(())
    }
}
