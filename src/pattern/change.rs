//! Change listeners on single bound instances.
//!
//! A change listener watches the fields an instance had when it was registered: structure events
//! on every existing field and value changes on those carrying a value. Changes are collected per
//! registration and handed over in one callback once the graph mutation that caused them was
//! delivered completely. Later mutations that were already queued may join the same callback.
use enumset::EnumSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    error::PatternError,
    event::ResourceEvent,
    graph::ResourceGraph,
    pattern::{
        access::{check_pattern, PatternAccess},
        definition::PatternDefinition,
        instance::PatternInstance,
    },
    properties::ListenerId,
};

/// Receives the changes of the fields of one instance.
///
/// Callbacks run on the dispatch thread and may use the graph freely.
pub trait PatternChangeListener: Send + Sync {
    fn pattern_changed(&self, instance: &PatternInstance, changes: &[FieldChange]);
}

/// One event on a field of a watched instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub event: ResourceEvent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeHandle(u64);

impl fmt::Display for ChangeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "change-{}", self.0)
    }
}

struct Collector {
    handle: ChangeHandle,
    instance: PatternInstance,
    listener: Arc<dyn PatternChangeListener>,
    live: AtomicBool,
    pending: Mutex<Vec<FieldChange>>,
}

impl Collector {
    fn collect(self: &Arc<Collector>, graph: &ResourceGraph, field: &str, event: &ResourceEvent) {
        let first = {
            let mut pending = self.pending.lock();
            pending.push(FieldChange {
                field: field.to_string(),
                event: event.clone(),
            });
            pending.len() == 1
        };
        if !first {
            return;
        }
        let collector = self.clone();
        let label = format!("{} changes of {}", self.handle, self.instance.root);
        if let Err(err) = graph.submit(&label, move || collector.flush()) {
            tracing::warn!("Could not queue {label}: {err}");
        }
    }

    fn flush(&self) {
        let changes = std::mem::take(&mut *self.pending.lock());
        if changes.is_empty() || !self.live.load(Ordering::Acquire) {
            return;
        }
        tracing::trace!(
            "{}: {} changes of {}",
            self.handle,
            changes.len(),
            self.instance.root
        );
        self.listener.pattern_changed(&self.instance, &changes);
    }
}

/// The graph listeners of one change registration.
pub(super) struct ChangeWatch {
    listeners: Vec<ListenerId>,
    collector: Arc<Collector>,
}

impl ChangeWatch {
    /// Removes the graph listeners. Changes collected but not yet reported are dropped.
    pub(super) fn release(self, graph: &ResourceGraph) {
        self.collector.live.store(false, Ordering::Release);
        for id in self.listeners {
            graph.remove_listener(id);
        }
    }
}

impl PatternAccess {
    /// Reports structure and value changes of the fields of `instance` to `listener` until the
    /// returned handle is removed. Fields that do not exist now are not watched.
    pub fn add_pattern_change_listener<L>(
        &self,
        instance: &PatternInstance,
        definition: &PatternDefinition,
        listener: L,
    ) -> Result<ChangeHandle, PatternError>
    where
        L: PatternChangeListener + 'static,
    {
        check_pattern(instance, definition)?;
        let graph = &self.inner.graph;
        if !graph.exists(&instance.root) {
            return Err(PatternError::NotFound(instance.root.to_string()));
        }
        let handle = ChangeHandle(self.inner.ids.next());
        let collector = Arc::new(Collector {
            handle,
            instance: instance.clone(),
            listener: Arc::new(listener),
            live: AtomicBool::new(true),
            pending: Mutex::new(Vec::new()),
        });
        let mut watch = ChangeWatch {
            listeners: Vec::new(),
            collector: collector.clone(),
        };
        for field in instance.fields.iter().filter(|field| field.exists) {
            let Some(path) = &field.path else {
                continue;
            };
            if !graph.exists(path) {
                continue;
            }
            let on_event = {
                let owner = Arc::downgrade(&self.inner);
                let collector = collector.clone();
                let name = field.name.clone();
                move |event: &ResourceEvent| {
                    if let Some(inner) = owner.upgrade() {
                        collector.collect(&inner.graph, &name, event);
                    }
                }
            };
            let registered = graph
                .add_structure_listener(path, EnumSet::all(), on_event.clone())
                .and_then(|id| {
                    watch.listeners.push(id);
                    match graph.value(path) {
                        Some(_) => graph.add_value_listener(path, false, on_event).map(Some),
                        None => Ok(None),
                    }
                });
            match registered {
                Ok(Some(id)) => watch.listeners.push(id),
                Ok(None) => {}
                Err(err) => {
                    watch.release(graph);
                    return Err(err);
                }
            }
        }
        tracing::debug!(
            "{handle}: watching {} fields of {} (pattern '{}')",
            watch.listeners.len(),
            instance.root,
            instance.pattern
        );
        self.inner.changes.lock().insert(handle, watch);
        Ok(handle)
    }

    /// Stops a change registration. Returns false for unknown handles.
    pub fn remove_pattern_change_listener(&self, handle: ChangeHandle) -> bool {
        let Some(watch) = self.inner.changes.lock().remove(&handle) else {
            tracing::warn!("Ignoring removal of unknown {handle}");
            return false;
        };
        watch.release(&self.inner.graph);
        true
    }
}
