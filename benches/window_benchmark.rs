//! Windowing performance benchmarks

use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use streamql::types::{NestedValue, Row, TimeCharacteristic, TimeUnit, WindowConfig, WindowKind};
use streamql::windows::tumbling::TumblingWindow;
use streamql::windows::{aligned_window_start, group_key, Window};

fn tumbling_processing_time_config() -> WindowConfig {
    WindowConfig {
        kind: WindowKind::Tumbling { size: Duration::from_secs(60) },
        time_characteristic: TimeCharacteristic::ProcessingTime,
        time_unit: TimeUnit::S,
        ..Default::default()
    }
}

/// Benchmark accepting rows into a tumbling window's bucket map, the hot path
/// every ingested row takes regardless of how often a window actually fires.
fn bench_tumbling_add(c: &mut Criterion) {
    let window = TumblingWindow::new(tumbling_processing_time_config(), 64).unwrap();
    let row = Row::new(NestedValue::Null, Instant::now());

    c.bench_function("tumbling_window_add", |b| {
        b.iter(|| window.add(black_box(row.clone())));
    });
}

/// Benchmark the epoch-alignment arithmetic used to assign every row to its
/// bucket start.
fn bench_aligned_window_start(c: &mut Criterion) {
    let epoch = Instant::now();
    let size = Duration::from_secs(2);
    let ts = epoch + Duration::from_millis(123_456);

    c.bench_function("aligned_window_start", |b| {
        b.iter(|| black_box(aligned_window_start(black_box(ts), black_box(epoch), black_box(size))));
    });
}

/// Benchmark group-key formation over a multi-field GROUP BY with nested paths.
fn bench_group_key(c: &mut Criterion) {
    let mut fields = std::collections::HashMap::new();
    fields.insert("location".to_string(), NestedValue::String("rack-a".to_string()));
    let mut device = std::collections::HashMap::new();
    device.insert("device".to_string(), NestedValue::Map(fields));
    device.insert("region".to_string(), NestedValue::String("us-east".to_string()));
    let row_data = NestedValue::Map(device);
    let group_by_key = vec!["device.location".to_string(), "region".to_string()];

    c.bench_function("group_key_two_fields", |b| {
        b.iter(|| black_box(group_key(black_box(&row_data), black_box(&group_by_key))));
    });
}

criterion_group!(benches, bench_tumbling_add, bench_aligned_window_start, bench_group_key);
criterion_main!(benches);
