//! streamql demo binary — not part of the library; demonstrates compiling a
//! query, feeding it a handful of records, and printing the sink output.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use streamql::pipeline::{Engine, EngineOptions};
use streamql::types::NestedValue;

fn reading(location: &str, temperature: f64) -> NestedValue {
    let mut sensor = std::collections::HashMap::new();
    sensor.insert("temperature".to_string(), NestedValue::Float(temperature));
    let mut device = std::collections::HashMap::new();
    device.insert("location".to_string(), NestedValue::String(location.to_string()));
    let mut data = std::collections::HashMap::new();
    data.insert("device".to_string(), NestedValue::Map(device));
    data.insert("sensor".to_string(), NestedValue::Map(sensor));
    NestedValue::Map(data)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("starting streamql demo (v{})", streamql::VERSION);

    let engine = Engine::new(EngineOptions::default());
    engine
        .execute("SELECT device.location AS loc, sensor.temperature AS t FROM s WHERE sensor.temperature > 15")
        .expect("query compiles");

    engine.add_sink(Arc::new(|batch| {
        for row in batch {
            println!("{}", serde_json::Value::Object(row));
        }
    }));

    for (location, temperature) in [("rack-a", 12.0), ("rack-b", 22.5), ("rack-a", 31.0)] {
        engine.emit(reading(location, temperature));
    }

    tokio::time::sleep(Duration::from_millis(100)).await;

    info!("stats: {:?}", engine.get_stats());
    engine.stop();
}
