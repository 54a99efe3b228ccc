//! Grouped incremental aggregator (§4.5): reduces a window's row batch into
//! one output row per distinct group, honoring HAVING, DISTINCT, and LIMIT.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::expr::CompiledExpr;
use crate::field_accessor::CompiledPath;
use crate::function_registry::{Accumulator, FunctionRegistry};
use crate::types::{NestedValue, OutputRow, Row, StreamConfig};

struct NullAccumulator;
impl Accumulator for NullAccumulator {
    fn add(&mut self, _value: &NestedValue) {}
    fn result(&self) -> NestedValue {
        NestedValue::Null
    }
}

enum AliasKind {
    Simple,
    Expression,
    Aggregate(String),
}

struct AliasPlan {
    alias: String,
    kind: AliasKind,
    input_expr: Option<CompiledExpr>,
    input_path: Option<Arc<CompiledPath>>,
}

/// Compiled per-query aggregation plan. One instance is built at `execute`
/// time and reused across every batch the window emits.
pub struct Aggregator {
    config: StreamConfig,
    registry: Arc<FunctionRegistry>,
    plans: Vec<AliasPlan>,
    group_paths: Vec<Arc<CompiledPath>>,
    having: Option<CompiledExpr>,
}

impl Aggregator {
    pub fn new(config: StreamConfig, registry: Arc<FunctionRegistry>) -> Result<Self> {
        let mut plans = Vec::with_capacity(config.field_order.len());
        for alias in &config.field_order {
            let kind_str = config.select_fields.get(alias).map(String::as_str).unwrap_or("");
            let kind = if kind_str.is_empty() {
                AliasKind::Simple
            } else if kind_str == "expression" {
                AliasKind::Expression
            } else {
                AliasKind::Aggregate(kind_str.to_string())
            };
            let input_expr = match config.field_expressions.get(alias) {
                Some(fe) => Some(CompiledExpr::compile(&fe.expression_text, registry.as_ref())?),
                None => None,
            };
            let input_path = if input_expr.is_none() {
                match config.field_alias.get(alias) {
                    Some(path) if path != "*" && !path.is_empty() => Some(CompiledPath::compile(path)?),
                    _ => None,
                }
            } else {
                None
            };
            plans.push(AliasPlan { alias: alias.clone(), kind, input_expr, input_path });
        }
        let group_paths = config.group_fields.iter().map(|p| CompiledPath::compile(p)).collect::<Result<Vec<_>>>()?;
        let having = match &config.having {
            Some(src) => Some(CompiledExpr::compile(src, registry.as_ref())?),
            None => None,
        };
        Ok(Aggregator { config, registry, plans, group_paths, having })
    }

    fn group_key(&self, row: &Row) -> String {
        if self.group_paths.is_empty() {
            return String::new();
        }
        self.group_paths.iter().map(|p| p.resolve(&row.data).to_canonical_string()).collect::<Vec<_>>().join("\u{1f}")
    }

    /// Reduce one window batch into its per-group output rows, in
    /// first-appearance order, with HAVING/DISTINCT/LIMIT applied.
    pub fn reduce(&self, batch: Vec<Row>) -> Vec<OutputRow> {
        let mut group_order: Vec<String> = Vec::new();
        let mut accumulators: HashMap<String, HashMap<String, Box<dyn Accumulator>>> = HashMap::new();
        let mut last_values: HashMap<String, HashMap<String, NestedValue>> = HashMap::new();

        for row in &batch {
            let key = self.group_key(row);
            if !accumulators.contains_key(&key) {
                group_order.push(key.clone());
                accumulators.insert(key.clone(), HashMap::new());
                last_values.insert(key.clone(), HashMap::new());
            }
            for plan in &self.plans {
                match &plan.kind {
                    AliasKind::Aggregate(func_name) => {
                        let is_count_star = func_name.eq_ignore_ascii_case("count")
                            && plan.input_expr.is_none()
                            && plan.input_path.is_none();
                        let value = if is_count_star {
                            NestedValue::Int(1)
                        } else if let Some(expr) = &plan.input_expr {
                            expr.eval(&row.data, &self.registry)
                        } else if let Some(path) = &plan.input_path {
                            path.resolve(&row.data)
                        } else {
                            NestedValue::Null
                        };
                        let group_accs = accumulators.get_mut(&key).unwrap();
                        let registry = &self.registry;
                        let acc = group_accs.entry(plan.alias.clone()).or_insert_with(|| {
                            registry
                                .lookup(func_name)
                                .ok()
                                .and_then(|spec| spec.new_accumulator())
                                .unwrap_or_else(|| Box::new(NullAccumulator))
                        });
                        acc.add(&value);
                    }
                    AliasKind::Expression => {
                        let value = plan
                            .input_expr
                            .as_ref()
                            .map(|e| e.eval(&row.data, &self.registry))
                            .unwrap_or(NestedValue::Null);
                        last_values.get_mut(&key).unwrap().insert(plan.alias.clone(), value);
                    }
                    AliasKind::Simple => {
                        let value = match &plan.input_path {
                            Some(path) => path.resolve(&row.data),
                            None => row.data.clone(),
                        };
                        last_values.get_mut(&key).unwrap().insert(plan.alias.clone(), value);
                    }
                }
            }
        }

        let mut output: Vec<OutputRow> = Vec::with_capacity(group_order.len());
        for key in &group_order {
            let mut fields = Vec::with_capacity(self.plans.len());
            for plan in &self.plans {
                let value = match &plan.kind {
                    AliasKind::Aggregate(_) => accumulators
                        .get(key)
                        .and_then(|m| m.get(&plan.alias))
                        .map(|acc| acc.result())
                        .unwrap_or(NestedValue::Null),
                    _ => last_values.get(key).and_then(|m| m.get(&plan.alias)).cloned().unwrap_or(NestedValue::Null),
                };
                fields.push((plan.alias.clone(), value));
            }
            let row = OutputRow(fields);
            if let Some(having) = &self.having {
                if !having.eval_bool(&row.as_context(), &self.registry) {
                    continue;
                }
            }
            output.push(row);
        }

        if self.config.distinct {
            let mut seen: Vec<OutputRow> = Vec::new();
            output.retain(|row| {
                if seen.contains(row) {
                    false
                } else {
                    seen.push(row.clone());
                    true
                }
            });
        }

        if self.config.limit > 0 && output.len() > self.config.limit {
            output.truncate(self.config.limit);
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldExpression;
    use std::collections::HashMap as StdHashMap;
    use std::time::Instant;

    fn row(loc: &str, temp: f64) -> Row {
        let mut sensor = StdHashMap::new();
        sensor.insert("temperature".to_string(), NestedValue::Float(temp));
        let mut device = StdHashMap::new();
        device.insert("location".to_string(), NestedValue::String(loc.to_string()));
        let mut data = StdHashMap::new();
        data.insert("device".to_string(), NestedValue::Map(device));
        data.insert("sensor".to_string(), NestedValue::Map(sensor));
        Row::new(NestedValue::Map(data), Instant::now())
    }

    fn scenario_b_config() -> StreamConfig {
        let mut select_fields = StdHashMap::new();
        select_fields.insert("loc".to_string(), "".to_string());
        select_fields.insert("avg_t".to_string(), "avg".to_string());
        select_fields.insert("c".to_string(), "count".to_string());

        let mut field_alias = StdHashMap::new();
        field_alias.insert("loc".to_string(), "device.location".to_string());
        field_alias.insert("avg_t".to_string(), "sensor.temperature".to_string());

        StreamConfig {
            group_fields: vec!["device.location".to_string()],
            select_fields,
            field_alias,
            field_expressions: StdHashMap::new(),
            field_order: vec!["loc".to_string(), "avg_t".to_string(), "c".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn grouped_average_and_count() {
        let registry = Arc::new(FunctionRegistry::new());
        let agg = Aggregator::new(scenario_b_config(), registry).unwrap();
        let batch = vec![row("X", 10.0), row("X", 20.0)];
        let out = agg.reduce(batch);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("loc"), Some(&NestedValue::String("X".into())));
        assert_eq!(out[0].get("avg_t"), Some(&NestedValue::Float(15.0)));
        assert_eq!(out[0].get("c"), Some(&NestedValue::Int(2)));
    }

    #[test]
    fn having_filters_groups() {
        let registry = Arc::new(FunctionRegistry::new());
        let mut config = scenario_b_config();
        config.having = Some("avg_t > 16".to_string());
        let agg = Aggregator::new(config, registry).unwrap();
        let batch = vec![row("X", 10.0), row("X", 20.0), row("Y", 30.0), row("Y", 30.0)];
        let out = agg.reduce(batch);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("loc"), Some(&NestedValue::String("Y".into())));
    }

    #[test]
    fn expression_projection_keeps_last_row_value() {
        let registry = Arc::new(FunctionRegistry::new());
        let mut config = StreamConfig::default();
        config.select_fields.insert("doubled".to_string(), "expression".to_string());
        config.field_expressions.insert(
            "doubled".to_string(),
            FieldExpression { expression_text: "sensor.temperature * 2".to_string(), referenced_fields: vec![] },
        );
        config.field_order = vec!["doubled".to_string()];
        let agg = Aggregator::new(config, registry).unwrap();
        let out = agg.reduce(vec![row("X", 5.0), row("X", 7.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("doubled"), Some(&NestedValue::Float(14.0)));
    }

    #[test]
    fn limit_truncates_output() {
        let registry = Arc::new(FunctionRegistry::new());
        let mut config = scenario_b_config();
        config.limit = 1;
        let agg = Aggregator::new(config, registry).unwrap();
        let out = agg.reduce(vec![row("X", 1.0), row("Y", 2.0)]);
        assert_eq!(out.len(), 1);
    }
}
