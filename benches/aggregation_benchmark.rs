//! Aggregation performance benchmarks

use std::collections::HashMap as StdHashMap;
use std::sync::Arc;
use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use streamql::aggregator::Aggregator;
use streamql::function_registry::FunctionRegistry;
use streamql::types::{NestedValue, Row, StreamConfig};

fn reading_row(loc: &str, temp: f64) -> Row {
    let mut sensor = StdHashMap::new();
    sensor.insert("temperature".to_string(), NestedValue::Float(temp));
    let mut device = StdHashMap::new();
    device.insert("location".to_string(), NestedValue::String(loc.to_string()));
    let mut data = StdHashMap::new();
    data.insert("device".to_string(), NestedValue::Map(device));
    data.insert("sensor".to_string(), NestedValue::Map(sensor));
    Row::new(NestedValue::Map(data), Instant::now())
}

fn grouped_avg_count_config() -> StreamConfig {
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

/// Benchmark reducing a single-group batch of rows.
fn bench_reduce_single_group(c: &mut Criterion) {
    let registry = Arc::new(FunctionRegistry::new());
    let agg = Aggregator::new(grouped_avg_count_config(), registry).unwrap();
    let batch: Vec<Row> = (0..1000).map(|i| reading_row("rack-a", i as f64)).collect();

    c.bench_function("aggregator_reduce_single_group_1000_rows", |b| {
        b.iter(|| black_box(agg.reduce(black_box(batch.clone()))))
    });
}

/// Benchmark reducing a batch spread across many distinct groups.
fn bench_reduce_many_groups(c: &mut Criterion) {
    let registry = Arc::new(FunctionRegistry::new());
    let agg = Aggregator::new(grouped_avg_count_config(), registry).unwrap();
    let batch: Vec<Row> = (0..1000).map(|i| reading_row(&format!("rack-{}", i % 50), i as f64)).collect();

    c.bench_function("aggregator_reduce_50_groups_1000_rows", |b| {
        b.iter(|| black_box(agg.reduce(black_box(batch.clone()))))
    });
}

/// Benchmark the HAVING filter pass on top of grouped reduction.
fn bench_reduce_with_having(c: &mut Criterion) {
    let registry = Arc::new(FunctionRegistry::new());
    let mut config = grouped_avg_count_config();
    config.having = Some("avg_t > 500".to_string());
    let agg = Aggregator::new(config, registry).unwrap();
    let batch: Vec<Row> = (0..1000).map(|i| reading_row(&format!("rack-{}", i % 50), i as f64)).collect();

    c.bench_function("aggregator_reduce_having_1000_rows", |b| {
        b.iter(|| black_box(agg.reduce(black_box(batch.clone()))))
    });
}

criterion_group!(benches, bench_reduce_single_group, bench_reduce_many_groups, bench_reduce_with_having);
criterion_main!(benches);
