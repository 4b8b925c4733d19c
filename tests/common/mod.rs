//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use parking_lot::Mutex;
use resource_patterns::{
    graph::ResourceGraph,
    model::TypeRegistry,
    paths::ResourcePath,
    pattern::{PatternInstance, PatternListener},
    properties::ConsumerId,
};
use std::{sync::Arc, time::Duration};

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// A small building model: rooms with a heater and a temperature sensor.
#[allow(dead_code)]
pub const BUILDING_MODELS: &str = r#"
[[types]]
name = "Building"
[types.elements]
address = "String"

[[types]]
name = "Room"
[types.elements]
temperatureSensor = "TemperatureSensor"
heater = "Heater"

[[types]]
name = "TemperatureSensor"
[types.elements]
reading = "Float"
upperLimit = "Float"

[[types]]
name = "Heater"
[types.elements]
setpoint = "Float"
stateControl = "Boolean"
"#;

#[allow(dead_code)]
pub fn building_graph() -> ResourceGraph {
    init_logging();
    let types = TypeRegistry::from_toml_str(BUILDING_MODELS).unwrap();
    ResourceGraph::new(types).unwrap()
}

#[allow(dead_code)]
pub fn path(s: &str) -> ResourcePath {
    s.parse().unwrap()
}

#[allow(dead_code)]
pub fn settle(graph: &ResourceGraph) {
    assert!(graph.wait_idle(Duration::from_secs(5)).unwrap());
}

/// Creates an active room at `name` with a sensor reading `reading` and a heater.
#[allow(dead_code)]
pub fn create_room(graph: &ResourceGraph, name: &str, reading: f64) {
    let room = graph.top_level(name, "Room").unwrap().create().unwrap();
    let sensor = room.sub_resource("temperatureSensor").unwrap().create().unwrap();
    sensor
        .sub_resource("reading")
        .unwrap()
        .create()
        .unwrap()
        .set_value(reading, ConsumerId::nil())
        .unwrap();
    let heater = room.sub_resource("heater").unwrap().create().unwrap();
    heater.sub_resource("stateControl").unwrap().create().unwrap();
    room.activate(true).unwrap();
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Call {
    Available(ResourcePath),
    Unavailable(ResourcePath),
}

/// Records pattern callbacks. Clones share the record.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
}

#[allow(dead_code)]
impl Recorder {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl PatternListener for Recorder {
    fn available(&self, instance: &PatternInstance) {
        self.calls.lock().push(Call::Available(instance.root.clone()));
    }

    fn unavailable(&self, instance: &PatternInstance) {
        self.calls
            .lock()
            .push(Call::Unavailable(instance.root.clone()));
    }
}
