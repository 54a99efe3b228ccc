//! Core data model: `NestedValue`, `Row`, `TimeSlot`, and the `StreamConfig`
//! contract the SQL compiler (see [`crate::sql`]) must produce.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// A loosely-typed, recursively-nested value. This is the shape every
/// ingested record, and every value flowing through expressions and
/// aggregates, is represented as.
///
/// Arbitrary nesting depth is allowed; callers are recommended to keep it
/// shallow (<= 5 levels) for the field accessor's cache to stay effective.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NestedValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<NestedValue>),
    Map(HashMap<String, NestedValue>),
}

impl Default for NestedValue {
    fn default() -> Self {
        NestedValue::Null
    }
}

impl NestedValue {
    pub fn is_null(&self) -> bool {
        matches!(self, NestedValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            NestedValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NestedValue::Int(i) => Some(*i as f64),
            NestedValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            NestedValue::Int(i) => Some(*i),
            NestedValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            NestedValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[NestedValue]> {
        match self {
            NestedValue::List(l) => Some(l.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, NestedValue>> {
        match self {
            NestedValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Canonical string form used by LIKE coercion and group-key formation.
    pub fn to_canonical_string(&self) -> String {
        match self {
            NestedValue::Null => String::new(),
            NestedValue::Bool(b) => b.to_string(),
            NestedValue::Int(i) => i.to_string(),
            NestedValue::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() {
                    format!("{:.1}", f)
                } else {
                    f.to_string()
                }
            }
            NestedValue::String(s) => s.clone(),
            NestedValue::List(_) | NestedValue::Map(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }

    /// Numeric truthiness / equality helpers used by the expression evaluator
    /// live in [`crate::expr`]; this type stays a pure data representation.
    pub fn is_numeric(&self) -> bool {
        matches!(self, NestedValue::Int(_) | NestedValue::Float(_))
    }
}

impl PartialEq for NestedValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (NestedValue::Null, NestedValue::Null) => true,
            (NestedValue::Bool(a), NestedValue::Bool(b)) => a == b,
            (NestedValue::Int(a), NestedValue::Int(b)) => a == b,
            (NestedValue::Float(a), NestedValue::Float(b)) => a == b,
            (NestedValue::Int(a), NestedValue::Float(b)) | (NestedValue::Float(b), NestedValue::Int(a)) => {
                (*a as f64) == *b
            }
            (NestedValue::String(a), NestedValue::String(b)) => a == b,
            (NestedValue::List(a), NestedValue::List(b)) => a == b,
            (NestedValue::Map(a), NestedValue::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl From<serde_json::Value> for NestedValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => NestedValue::Null,
            serde_json::Value::Bool(b) => NestedValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    NestedValue::Int(i)
                } else {
                    NestedValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => NestedValue::String(s),
            serde_json::Value::Array(a) => NestedValue::List(a.into_iter().map(Into::into).collect()),
            serde_json::Value::Object(o) => {
                NestedValue::Map(o.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<NestedValue> for serde_json::Value {
    fn from(v: NestedValue) -> Self {
        match v {
            NestedValue::Null => serde_json::Value::Null,
            NestedValue::Bool(b) => serde_json::Value::Bool(b),
            NestedValue::Int(i) => serde_json::Value::Number(i.into()),
            NestedValue::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            NestedValue::String(s) => serde_json::Value::String(s),
            NestedValue::List(l) => serde_json::Value::Array(l.into_iter().map(Into::into).collect()),
            NestedValue::Map(m) => {
                serde_json::Value::Object(m.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

/// A half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy)]
pub struct TimeSlot {
    pub start: Instant,
    pub end: Instant,
}

impl TimeSlot {
    pub fn new(start: Instant, end: Instant) -> Self {
        TimeSlot { start, end }
    }

    pub fn contains(&self, t: Instant) -> bool {
        self.start <= t && t < self.end
    }
}

impl PartialEq for TimeSlot {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start && self.end == other.end
    }
}
impl Eq for TimeSlot {}

impl PartialOrd for TimeSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.end.cmp(&other.end).then(self.start.cmp(&other.start)))
    }
}
impl Ord for TimeSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.end.cmp(&other.end).then(self.start.cmp(&other.start))
    }
}

/// A record flowing through the pipeline.
#[derive(Debug, Clone)]
pub struct Row {
    pub data: NestedValue,
    pub timestamp: Instant,
    pub slot: Option<TimeSlot>,
}

impl Row {
    pub fn new(data: NestedValue, timestamp: Instant) -> Self {
        Row { data, timestamp, slot: None }
    }

    pub fn with_slot(mut self, slot: TimeSlot) -> Self {
        self.slot = Some(slot);
        self
    }
}

/// Unit used to interpret an integer epoch timestamp field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Ns,
    Ms,
    S,
    M,
    H,
    D,
}

impl TimeUnit {
    pub fn to_duration(self, amount: i64) -> Duration {
        let amount = amount.max(0) as u64;
        match self {
            TimeUnit::Ns => Duration::from_nanos(amount),
            TimeUnit::Ms => Duration::from_millis(amount),
            TimeUnit::S => Duration::from_secs(amount),
            TimeUnit::M => Duration::from_secs(amount * 60),
            TimeUnit::H => Duration::from_secs(amount * 3600),
            TimeUnit::D => Duration::from_secs(amount * 86400),
        }
    }
}

/// Whether windows trigger on wall-clock arrival time or on timestamps
/// extracted from the record itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeCharacteristic {
    ProcessingTime,
    EventTime,
}

/// The windowing strategy and its parameters, as produced by the compiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowKind {
    Tumbling { size: Duration },
    Sliding { size: Duration, slide: Duration },
    Counting { threshold: usize },
    Session { timeout: Duration },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    pub kind: WindowKind,
    pub ts_prop: Option<String>,
    pub time_unit: TimeUnit,
    pub time_characteristic: TimeCharacteristic,
    pub max_out_of_orderness: Duration,
    pub allowed_lateness: Duration,
    pub idle_timeout: Duration,
    pub watermark_interval: Duration,
    /// For session windows: the field identifying distinct sessions.
    pub group_by_key: Vec<String>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            kind: WindowKind::Tumbling { size: Duration::from_secs(1) },
            ts_prop: None,
            time_unit: TimeUnit::S,
            time_characteristic: TimeCharacteristic::ProcessingTime,
            max_out_of_orderness: Duration::ZERO,
            allowed_lateness: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            watermark_interval: Duration::from_secs(1),
            group_by_key: Vec::new(),
        }
    }
}

/// A non-trivial projection expression compiled for a single output alias.
#[derive(Debug, Clone)]
pub struct FieldExpression {
    pub expression_text: String,
    pub referenced_fields: Vec<String>,
}

/// The declarative, immutable description of a compiled stream query. This
/// is the contract between the (external) SQL compiler and the runtime.
#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    pub window_config: Option<WindowConfig>,
    pub group_fields: Vec<String>,
    /// output alias -> aggregate kind ("avg", "count", ..., or "expression")
    pub select_fields: HashMap<String, String>,
    /// output alias -> underlying input field/path
    pub field_alias: HashMap<String, String>,
    /// output alias -> non-trivial projection expression
    pub field_expressions: HashMap<String, FieldExpression>,
    /// SELECT-order of output aliases
    pub field_order: Vec<String>,
    /// "name[:alias]" entries used when there is no aggregate; "*" selects all
    pub simple_fields: Vec<String>,
    pub where_clause: Option<String>,
    pub having: Option<String>,
    pub distinct: bool,
    pub limit: usize,
    pub need_window: bool,
    pub performance_config: crate::config::PerformanceConfig,
}

impl Default for WindowKind {
    fn default() -> Self {
        WindowKind::Tumbling { size: Duration::from_secs(1) }
    }
}

/// One emitted result row: an ordered alias -> value list. Ordering follows
/// `StreamConfig.field_order` and must be preserved through serialization
/// (§8 invariant 3), which rules out a plain `HashMap` here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputRow(pub Vec<(String, NestedValue)>);

impl OutputRow {
    pub fn get(&self, key: &str) -> Option<&NestedValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn as_context(&self) -> NestedValue {
        NestedValue::Map(self.0.iter().cloned().collect())
    }

    pub fn to_json_map(&self) -> serde_json::Map<String, serde_json::Value> {
        self.0.iter().map(|(k, v)| (k.clone(), v.clone().into())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_value_numeric_equality_widens() {
        assert_eq!(NestedValue::Int(2), NestedValue::Float(2.0));
    }

    #[test]
    fn time_slot_contains_is_half_open() {
        let start = Instant::now();
        let end = start + Duration::from_secs(1);
        let slot = TimeSlot::new(start, end);
        assert!(slot.contains(start));
        assert!(!slot.contains(end));
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let v = serde_json::json!({"a": {"b": [1, 2, "x"]}});
        let nested: NestedValue = v.clone().into();
        let back: serde_json::Value = nested.into();
        assert_eq!(v, back);
    }
}
