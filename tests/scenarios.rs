//! End-to-end scenario tests driving the engine through compiled SQL
//! strings, exercising nested projection, windowed aggregation, and
//! backpressure.

use std::collections::HashMap;
use std::time::Duration;

use streamql::config::OverflowStrategy;
use streamql::pipeline::{Engine, EngineOptions};
use streamql::types::NestedValue;

fn map(pairs: Vec<(&str, NestedValue)>) -> NestedValue {
    NestedValue::Map(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}

fn reading(name: &str, location: &str, temperature: f64) -> NestedValue {
    map(vec![
        ("device", map(vec![("info", map(vec![("name", NestedValue::String(name.to_string()))])), ("location", NestedValue::String(location.to_string()))])),
        ("sensor", map(vec![("temperature", NestedValue::Float(temperature))])),
    ])
}

#[tokio::test]
async fn scenario_a_nested_projection() {
    let engine = Engine::new(EngineOptions::default());
    engine
        .execute("SELECT device.info.name AS n, sensor.temperature AS t FROM s WHERE device.location = 'A' AND sensor.temperature > 20")
        .unwrap();

    let out = engine.emit_sync(reading("S1", "A", 25.5)).unwrap();
    let out = out.expect("matching row produces output");
    assert_eq!(out.get("n"), Some(&NestedValue::String("S1".into())));
    assert_eq!(out.get("t"), Some(&NestedValue::Float(25.5)));

    assert!(engine.emit_sync(reading("S2", "B", 25.5)).unwrap().is_none());
    assert!(engine.emit_sync(reading("S3", "A", 15.0)).unwrap().is_none());
    engine.stop();
}

#[tokio::test]
async fn scenario_b_tumbling_aggregation_event_time() {
    let engine = Engine::new(EngineOptions::default());
    engine
        .execute(
            "SELECT device.location AS loc, AVG(sensor.temperature) AS avg_t, COUNT(*) AS c \
             FROM s GROUP BY device.location, TumblingWindow('2s') WITH (TIMESTAMP='ts', TIMEUNIT='ss')",
        )
        .unwrap();

    let mut rx = engine.to_channel();
    for (ts, temp) in [(0i64, 10.0), (1, 20.0), (2, 30.0), (3, 40.0)] {
        engine.emit(map(vec![
            ("ts", NestedValue::Int(ts)),
            ("device", map(vec![("location", NestedValue::String("X".into()))])),
            ("sensor", map(vec![("temperature", NestedValue::Float(temp))])),
        ]));
    }

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.expect("first window emits").unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].get("loc"), Some(&serde_json::Value::String("X".into())));
    assert_eq!(first[0].get("avg_t"), Some(&serde_json::json!(15.0)));
    assert_eq!(first[0].get("c"), Some(&serde_json::json!(2)));

    engine.stop();
}

#[tokio::test]
async fn scenario_c_counting_window_per_group() {
    let engine = Engine::new(EngineOptions::default());
    engine.execute("SELECT k, AVG(v) AS a FROM s GROUP BY k, CountingWindow(3)").unwrap();

    let mut rx = engine.to_channel();
    let rows = [("A", 1.0), ("B", 10.0), ("A", 2.0), ("A", 3.0), ("B", 20.0), ("B", 30.0)];
    for (k, v) in rows {
        engine.emit(map(vec![("k", NestedValue::String(k.to_string())), ("v", NestedValue::Float(v))]));
    }

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.expect("group A closes first").unwrap();
    assert_eq!(first[0].get("k"), Some(&serde_json::Value::String("A".into())));
    assert_eq!(first[0].get("a"), Some(&serde_json::json!(2.0)));

    let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.expect("group B closes next").unwrap();
    assert_eq!(second[0].get("k"), Some(&serde_json::Value::String("B".into())));
    assert_eq!(second[0].get("a"), Some(&serde_json::json!(20.0)));

    engine.stop();
}

#[tokio::test]
async fn scenario_d_session_window_closes_after_idle_timeout() {
    let engine = Engine::new(EngineOptions::default());
    engine.execute("SELECT user_id AS u FROM s GROUP BY user_id, SessionWindow('1s')").unwrap();

    let mut rx = engine.to_channel();
    engine.emit(map(vec![("user_id", NestedValue::String("U".into()))]));

    let batch = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.expect("session eventually closes").unwrap();
    assert_eq!(batch[0].get("u"), Some(&serde_json::Value::String("U".into())));

    engine.stop();
}

#[tokio::test]
async fn scenario_e_negative_index_projection() {
    let engine = Engine::new(EngineOptions::default());
    engine.execute("SELECT tags[-1] AS last FROM s").unwrap();

    let with_tags = map(vec![("tags", NestedValue::List(vec![NestedValue::String("a".into()), NestedValue::String("b".into()), NestedValue::String("c".into())]))]);
    let out = engine.emit_sync(with_tags).unwrap().unwrap();
    assert_eq!(out.get("last"), Some(&NestedValue::String("c".into())));

    let empty_tags = map(vec![("tags", NestedValue::List(vec![]))]);
    let out = engine.emit_sync(empty_tags).unwrap().unwrap();
    assert_eq!(out.get("last"), Some(&NestedValue::Null));

    engine.stop();
}

#[tokio::test]
async fn scenario_f_backpressure_drop_is_counted() {
    let options = EngineOptions::default()
        .with_buffer_sizes(1, 1, 1)
        .with_overflow_strategy(OverflowStrategy::Drop);
    let engine = Engine::new(options);
    engine.execute("SELECT k FROM s").unwrap();

    for i in 0..1000 {
        engine.emit(map(vec![("k", NestedValue::Int(i))]));
    }

    let stats: HashMap<String, i64> = engine.get_stats();
    let input = stats["input_count"];
    let dropped = stats["dropped_count"];
    assert_eq!(input + dropped, 1000);
    assert!(dropped > 0);

    engine.stop();
}
