//! Shared test utilities for graph and matcher unit tests

use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};

use crate::{
    event::ResourceEvent,
    graph::ResourceGraph,
    model::TypeRegistry,
    paths::ResourcePath,
    pattern::{PatternInstance, PatternListener},
};

/// Initialize logging for tests
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

pub const TEST_MODELS: &str = r#"
[[types]]
name = "Room"
[types.elements]
temperatureSensor = "TemperatureSensor"
heater = "Heater"
name = "String"

[[types]]
name = "Sensor"
[types.elements]
reading = "Float"

[[types]]
name = "TemperatureSensor"
extends = "Sensor"
[types.elements]
upperLimit = "Float"
settings = "SensorSettings"

[[types]]
name = "SensorSettings"
[types.elements]
setpoint = "Float"

[[types]]
name = "OnOffSwitch"
[types.elements]
stateControl = "Boolean"
stateFeedback = "Boolean"

[[types]]
name = "Heater"
[types.elements]
onOffSwitch = "OnOffSwitch"
room = "Room"
"#;

pub fn test_types() -> TypeRegistry {
    TypeRegistry::from_toml_str(TEST_MODELS).unwrap()
}

/// A fresh graph over [TEST_MODELS] with logging enabled.
pub fn test_graph() -> ResourceGraph {
    init_logging();
    ResourceGraph::new(test_types()).unwrap()
}

pub fn path(s: &str) -> ResourcePath {
    s.parse().unwrap()
}

/// Waits for the dispatcher to drain, failing the test if it does not.
pub fn settle(graph: &ResourceGraph) {
    assert!(
        graph.wait_idle(Duration::from_secs(5)).unwrap(),
        "dispatcher did not become idle"
    );
}

/// A listener closure plus the events it has received.
pub fn event_recorder() -> (
    Arc<Mutex<Vec<ResourceEvent>>>,
    impl Fn(&ResourceEvent) + Send + Sync + 'static,
) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    (events, move |event: &ResourceEvent| {
        sink.lock().push(event.clone())
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Callback {
    Available(ResourcePath),
    Unavailable(ResourcePath),
}

/// Pattern listener recording every callback. Clones share the record.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<Callback>>>,
}

impl Recorder {
    pub fn calls(&self) -> Vec<Callback> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, root: &str) -> Vec<Callback> {
        let root = path(root);
        self.calls()
            .into_iter()
            .filter(|call| match call {
                Callback::Available(p) | Callback::Unavailable(p) => *p == root,
            })
            .collect()
    }

    /// Asserts the callbacks of every root alternate, starting with `available`.
    pub fn assert_alternating(&self) {
        let mut complete: std::collections::BTreeMap<ResourcePath, bool> = Default::default();
        for call in self.calls() {
            match call {
                Callback::Available(root) => {
                    let was = complete.insert(root.clone(), true).unwrap_or(false);
                    assert!(!was, "available fired twice for {root}");
                }
                Callback::Unavailable(root) => {
                    let was = complete.insert(root.clone(), false).unwrap_or(false);
                    assert!(was, "unavailable without available for {root}");
                }
            }
        }
    }
}

impl PatternListener for Recorder {
    fn available(&self, instance: &PatternInstance) {
        self.calls
            .lock()
            .push(Callback::Available(instance.root.clone()));
    }

    fn unavailable(&self, instance: &PatternInstance) {
        self.calls
            .lock()
            .push(Callback::Unavailable(instance.root.clone()));
    }
}
