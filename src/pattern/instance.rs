//! Binding and evaluation of one pattern instance: one root resource matched against one
//! [PatternDefinition].
//!
//! Every field is bound by walking its hops from the binding of its origin field. All records
//! visited on the way get a structure listener, so a change anywhere along the navigation (an
//! intermediate resource created or deleted, a reference redirected) triggers a rebind of the
//! field and everything navigated from it. Completeness is always recomputed over the whole
//! instance after the rebind, which makes a redirect look atomic to the state machine.
use enumset::EnumSet;
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
};

use crate::{
    dispatch::{Dispatcher, Listener, Scope},
    graph::{GraphView, Lookup},
    paths::ResourcePath,
    pattern::definition::{Hop, Operand, PatternContext, PatternDefinition},
    properties::{AccessPriority, ConsumerId, DemandId, ListenerId, ResourceId, ResourceValue},
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) enum Binding {
    /// Some hop before the last one does not exist.
    #[default]
    Unresolved,
    /// Only the last hop is missing.
    Virtual { path: ResourcePath },
    Resolved {
        node: ResourceId,
        real: ResourceId,
        path: ResourcePath,
    },
}

impl Binding {
    pub(crate) fn path(&self) -> Option<&ResourcePath> {
        match self {
            Binding::Unresolved => None,
            Binding::Virtual { path } | Binding::Resolved { path, .. } => Some(path),
        }
    }

    pub(crate) fn real(&self) -> Option<ResourceId> {
        match self {
            Binding::Resolved { real, .. } => Some(*real),
            _ => None,
        }
    }
}

/// What a field is subscribed to. Listeners are only replaced when this changes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Watch {
    structure: Vec<ResourceId>,
    value: Option<ResourceId>,
    access: Option<ResourceId>,
}

#[derive(Debug, Default)]
pub(crate) struct FieldState {
    pub(crate) binding: Binding,
    pub(crate) satisfied: bool,
    watch: Watch,
    listeners: Vec<ListenerId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Unresolved,
    Incomplete,
    Complete,
    Removed,
}

/// How required access modes are checked during evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AccessCheck {
    /// Against the grants the consumer currently holds.
    Granted,
    /// Against what a request at this priority would be granted now.
    Probe(AccessPriority),
}

/// Access requests a rebind leaves for the matcher to issue once the graph view is released.
#[derive(Debug, Default)]
pub(crate) struct AccessChanges {
    pub(crate) release: Vec<(usize, ResourceId)>,
    pub(crate) acquire: Vec<(usize, ResourceId)>,
}

impl AccessChanges {
    pub(crate) fn is_empty(&self) -> bool {
        self.release.is_empty() && self.acquire.is_empty()
    }
}

pub(crate) struct InstanceCore {
    pub(crate) root: ResourceId,
    pub(crate) fields: Vec<FieldState>,
    pub(crate) state: InstanceState,
    /// The snapshot handed to the last `available` callback, while the instance is complete.
    pub(crate) reported: Option<PatternInstance>,
}

impl InstanceCore {
    pub(crate) fn new(root: ResourceId, definition: &PatternDefinition) -> InstanceCore {
        InstanceCore {
            root,
            fields: definition
                .fields()
                .iter()
                .map(|_| FieldState::default())
                .collect(),
            state: InstanceState::Unresolved,
            reported: None,
        }
    }

    /// Binds every field without subscribing to anything. Used for one-shot queries.
    pub(crate) fn bind_detached(&mut self, view: &GraphView, definition: &PatternDefinition) {
        for &i in definition.order() {
            let (binding, _) = navigate(view, definition, &self.fields, self.root, i);
            self.fields[i].binding = binding;
        }
    }

    /// Re-navigates `affected` (which must be in dependency order) and replaces the listeners of
    /// every field whose watched records changed. Old listeners are removed deepest dependent
    /// first, new ones installed in dependency order, all under the same `view`.
    pub(crate) fn rebind<F>(
        &mut self,
        view: &GraphView,
        definition: &PatternDefinition,
        consumer: ConsumerId,
        affected: &[usize],
        make_listener: F,
    ) -> AccessChanges
    where
        F: Fn(usize) -> Listener,
    {
        let mut changes = AccessChanges::default();
        let mut swapped = Vec::new();
        for &i in affected {
            let (binding, structure) = navigate(view, definition, &self.fields, self.root, i);
            let condition = definition.field(i);
            let real = binding.real();
            let watch = Watch {
                structure,
                value: real.filter(|_| definition.watches_value(i)),
                access: real.filter(|_| condition.access.is_some()),
            };
            let state = &mut self.fields[i];
            if condition.access.is_some() && state.binding.real() != real {
                if let Some(old) = state.binding.real() {
                    changes.release.push((i, old));
                }
                if let Some(new) = real {
                    changes.acquire.push((i, new));
                }
            }
            if state.binding != binding {
                tracing::trace!(
                    "Field '{}' rebound: {:?} -> {:?}",
                    condition.name,
                    state.binding,
                    binding
                );
                state.binding = binding;
            }
            if state.watch != watch {
                state.watch = watch;
                swapped.push(i);
            }
        }

        for &i in swapped.iter().rev() {
            for id in self.fields[i].listeners.drain(..) {
                view.unlisten(id);
            }
        }
        for &i in &swapped {
            let listener = make_listener(i);
            let every_update = definition.field(i).every_update;
            let state = &mut self.fields[i];
            let mut ids: Vec<ListenerId> = state
                .watch
                .structure
                .iter()
                .map(|&record| {
                    let scope = Scope::Structure {
                        resource: record,
                        kinds: EnumSet::all(),
                    };
                    view.listen(scope, listener.clone())
                })
                .collect();
            if let Some(resource) = state.watch.value {
                ids.push(view.listen(
                    Scope::Value {
                        resource,
                        every_update,
                    },
                    listener.clone(),
                ));
            }
            if let Some(resource) = state.watch.access {
                ids.push(view.listen(
                    Scope::AccessMode {
                        resource,
                        consumer: Some(consumer),
                    },
                    listener.clone(),
                ));
            }
            state.listeners = ids;
        }
        changes
    }

    /// Drops every listener and returns the access holds the instance still has.
    pub(crate) fn release(
        &mut self,
        dispatcher: &Dispatcher,
        definition: &PatternDefinition,
    ) -> Vec<(usize, ResourceId)> {
        let mut held = Vec::new();
        for &i in definition.order().iter().rev() {
            let state = &mut self.fields[i];
            for id in state.listeners.drain(..) {
                dispatcher.remove_listener(id);
            }
            state.watch = Watch::default();
            if definition.field(i).access.is_some() {
                if let Some(real) = state.binding.real() {
                    held.push((i, real));
                }
            }
        }
        self.state = InstanceState::Removed;
        held
    }

    /// Recomputes the satisfaction of every field and returns whether the instance is complete.
    pub(crate) fn evaluate(
        &mut self,
        view: &GraphView,
        definition: &PatternDefinition,
        consumer: ConsumerId,
        check: AccessCheck,
        context: Option<&PatternContext>,
    ) -> bool {
        for &i in definition.order() {
            let satisfied = field_satisfied(view, definition, &self.fields, i, consumer, check);
            self.fields[i].satisfied = satisfied;
        }
        let required = definition
            .order()
            .iter()
            .all(|&i| self.fields[i].satisfied || !definition.is_required(i));
        if !required {
            return false;
        }
        let Some(accept) = definition.accept() else {
            return true;
        };
        let pattern_view = PatternView {
            view,
            definition,
            fields: &self.fields,
            context: context.map(|context| &**context),
        };
        match catch_unwind(AssertUnwindSafe(|| accept(&pattern_view))) {
            Ok(accepted) => accepted,
            Err(_) => {
                tracing::error!(
                    "Acceptance predicate of pattern '{}' panicked, treating the instance as not accepted",
                    definition.name()
                );
                false
            }
        }
    }

    pub(crate) fn root_path(&self) -> Option<&ResourcePath> {
        self.fields.first().and_then(|root| root.binding.path())
    }

    pub(crate) fn snapshot(
        &self,
        view: &GraphView,
        definition: &PatternDefinition,
        demand: Option<DemandId>,
    ) -> PatternInstance {
        let fields = definition
            .fields()
            .iter()
            .zip(&self.fields)
            .map(|(condition, state)| BoundField {
                name: condition.name.clone(),
                path: state.binding.path().cloned(),
                location: state
                    .binding
                    .real()
                    .filter(|real| view.arena().contains(*real))
                    .map(|real| view.arena().own_path(real)),
                exists: state.binding.real().is_some(),
                optional: condition.optional,
            })
            .collect();
        PatternInstance {
            demand,
            pattern: definition.name().to_string(),
            root: self.root_path().cloned().unwrap_or_else(ResourcePath::root),
            fields,
        }
    }
}

/// Walks the hops of field `index`. Returns the binding and every record visited on the way.
fn navigate(
    view: &GraphView,
    definition: &PatternDefinition,
    fields: &[FieldState],
    root: ResourceId,
    index: usize,
) -> (Binding, Vec<ResourceId>) {
    let arena = view.arena();
    if index == 0 {
        if !arena.contains(root) {
            return (Binding::Unresolved, Vec::new());
        }
        let path = arena.own_path(root);
        return (
            Binding::Resolved {
                node: root,
                real: root,
                path,
            },
            vec![root],
        );
    }
    let Binding::Resolved {
        mut node,
        mut real,
        mut path,
    } = fields[definition.origin(index)].binding.clone()
    else {
        return (Binding::Unresolved, Vec::new());
    };
    let mut visited = vec![node];
    let visit = |id: ResourceId, visited: &mut Vec<ResourceId>| {
        if !visited.contains(&id) {
            visited.push(id);
        }
    };
    let hops = &definition.field(index).hops;
    for (step, hop) in hops.iter().enumerate() {
        let last = step + 1 == hops.len();
        match hop {
            Hop::Child(name) => {
                let Ok(child_path) = path.child(name) else {
                    return (Binding::Unresolved, visited);
                };
                match arena.child(real, name) {
                    Some(child) => {
                        node = child;
                        real = arena.deref(child);
                        path = child_path;
                        visit(node, &mut visited);
                    }
                    None if last => return (Binding::Virtual { path: child_path }, visited),
                    None => return (Binding::Unresolved, visited),
                }
            }
            Hop::Parent => {
                let Some(parent_path) = path.parent().filter(|p| !p.is_root()) else {
                    return (Binding::Unresolved, visited);
                };
                match view.lookup(&parent_path) {
                    Lookup::Found {
                        node: parent,
                        real: parent_real,
                    } => {
                        node = parent;
                        real = parent_real;
                        path = parent_path;
                        visit(node, &mut visited);
                    }
                    _ => return (Binding::Unresolved, visited),
                }
            }
            Hop::Location => {
                node = real;
                path = arena.own_path(real);
                visit(node, &mut visited);
            }
        }
    }
    (Binding::Resolved { node, real, path }, visited)
}

fn field_satisfied(
    view: &GraphView,
    definition: &PatternDefinition,
    fields: &[FieldState],
    index: usize,
    consumer: ConsumerId,
    check: AccessCheck,
) -> bool {
    let Some(real) = fields[index].binding.real() else {
        return false;
    };
    let arena = view.arena();
    let Some(node) = arena.get(real) else {
        return false;
    };
    let condition = definition.field(index);
    if !view.types().is_a(&node.type_name, &condition.type_name) || !arena.is_active(real) {
        return false;
    }
    if let Some(constraint) = &condition.constraint {
        let Some(value) = arena.value(real) else {
            return false;
        };
        let operand = match &constraint.operand {
            Operand::Literal(literal) => Some(literal),
            Operand::Field(other) => definition
                .field_index(other)
                .and_then(|j| active_value(view, &fields[j])),
        };
        // a missing or inactive operand field does not constrain
        if let Some(operand) = operand {
            if !constraint.holds_for(value, operand) {
                return false;
            }
        }
    }
    let Some(access) = condition.access.filter(|access| access.required) else {
        return true;
    };
    let mode = match check {
        AccessCheck::Granted => view.access().mode(real, &consumer),
        AccessCheck::Probe(priority) => {
            view.access()
                .probe(real, consumer, access.mode, priority)
        }
    };
    mode.satisfies(access.mode)
}

fn active_value<'a>(view: &'a GraphView, field: &FieldState) -> Option<&'a ResourceValue> {
    let real = field.binding.real()?;
    if !view.arena().is_active(real) {
        return None;
    }
    view.arena().value(real)
}

/// Read access to a bound instance, handed to acceptance predicates.
pub struct PatternView<'a> {
    view: &'a GraphView,
    definition: &'a PatternDefinition,
    fields: &'a [FieldState],
    context: Option<&'a (dyn Any + Send + Sync)>,
}

impl<'a> PatternView<'a> {
    fn state(&self, field: &str) -> Option<&'a FieldState> {
        let fields: &'a [FieldState] = self.fields;
        self.definition.field_index(field).map(|i| &fields[i])
    }

    pub fn pattern(&self) -> &str {
        self.definition.name()
    }

    pub fn path(&self, field: &str) -> Option<&'a ResourcePath> {
        self.state(field)?.binding.path()
    }

    pub fn exists(&self, field: &str) -> bool {
        self.state(field)
            .map(|state| state.binding.real().is_some())
            .unwrap_or(false)
    }

    pub fn is_active(&self, field: &str) -> bool {
        self.state(field)
            .and_then(|state| state.binding.real())
            .map(|real| self.view.arena().is_active(real))
            .unwrap_or(false)
    }

    pub fn value(&self, field: &str) -> Option<&'a ResourceValue> {
        let real = self.state(field)?.binding.real()?;
        let view: &'a GraphView = self.view;
        view.arena().value(real)
    }

    /// The context the demand or query was made with, if there is one and it is a `T`.
    pub fn context<T: Any>(&self) -> Option<&'a T> {
        self.context?.downcast_ref::<T>()
    }

    /// Whether the field passed its own checks (existence, activity, constraint, access).
    pub fn satisfied(&self, field: &str) -> bool {
        self.state(field).map(|state| state.satisfied).unwrap_or(false)
    }
}

/// One field of a [PatternInstance].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundField {
    pub name: String,
    /// Path the field was reached through; None if an intermediate hop is missing.
    pub path: Option<ResourcePath>,
    /// Canonical path of the bound resource if it exists.
    pub location: Option<ResourcePath>,
    pub exists: bool,
    pub optional: bool,
}

/// Snapshot of a bound instance as handed to pattern listeners.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatternInstance {
    /// The demand the instance belongs to; None for instances from one-shot queries.
    pub demand: Option<DemandId>,
    pub pattern: String,
    pub root: ResourcePath,
    pub fields: Vec<BoundField>,
}

impl PatternInstance {
    pub fn field(&self, name: &str) -> Option<&BoundField> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Path of field `name` (the root is field `model`).
    pub fn path(&self, name: &str) -> Option<&ResourcePath> {
        self.field(name)?.path.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pattern::definition::Condition,
        properties::AccessMode,
        tests::helpers::{path, test_graph},
    };
    use std::sync::Arc;
    use test_log::test;

    fn definition(types: &crate::model::TypeRegistry) -> Arc<PatternDefinition> {
        PatternDefinition::builder("room", "Room")
            .condition(Condition::new("sensor", "TemperatureSensor").child("temperatureSensor"))
            .condition(
                Condition::new("reading", "Float")
                    .from("sensor")
                    .child("reading")
                    .compare(
                        crate::pattern::definition::CompareOp::Le,
                        Operand::Field("limit".to_string()),
                    ),
            )
            .condition(
                Condition::new("limit", "Float")
                    .from("sensor")
                    .child("upperLimit")
                    .optional(),
            )
            .build(types)
            .unwrap()
    }

    #[test]
    fn binds_through_references_and_reports_gaps() {
        let graph = test_graph();
        let definition = definition(&graph.types());
        let room = graph.top_level("room", "Room").unwrap().create().unwrap();
        let sensor = graph
            .top_level("sensor", "TemperatureSensor")
            .unwrap()
            .create()
            .unwrap();

        let view = graph.view();
        let root = view.resource_id(room.path()).unwrap();
        let mut core = InstanceCore::new(root, &definition);
        core.bind_detached(&view, &definition);
        let sensor_field = definition.field_index("sensor").unwrap();
        let reading_field = definition.field_index("reading").unwrap();
        assert_eq!(
            core.fields[sensor_field].binding,
            Binding::Virtual {
                path: path("room/temperatureSensor")
            }
        );
        assert_eq!(core.fields[reading_field].binding, Binding::Unresolved);
        drop(view);

        room.sub_resource("temperatureSensor")
            .unwrap()
            .set_as_reference(&sensor)
            .unwrap();
        sensor.sub_resource("reading").unwrap().create().unwrap();
        let view = graph.view();
        core.bind_detached(&view, &definition);
        let snapshot = core.snapshot(&view, &definition, None);
        assert_eq!(
            snapshot.path("reading"),
            Some(&path("room/temperatureSensor/reading"))
        );
        assert_eq!(
            snapshot.field("reading").unwrap().location,
            Some(path("sensor/reading"))
        );
        assert!(!snapshot.field("limit").unwrap().exists);
    }

    #[test]
    fn field_operands_constrain_only_when_active() {
        let graph = test_graph();
        let definition = definition(&graph.types());
        let consumer = ConsumerId::new();
        let room = graph.top_level("room", "Room").unwrap().create().unwrap();
        let sensor = room.sub_resource("temperatureSensor").unwrap();
        sensor.create().unwrap();
        let reading = sensor.sub_resource("reading").unwrap().create().unwrap();
        let limit = sensor.sub_resource("upperLimit").unwrap().create().unwrap();
        reading.set_value(27.0, consumer).unwrap();
        limit.set_value(25.0, consumer).unwrap();
        room.activate(true).unwrap();

        let evaluate = || {
            let view = graph.view();
            let root = view.resource_id(room.path()).unwrap();
            let mut core = InstanceCore::new(root, &definition);
            core.bind_detached(&view, &definition);
            core.evaluate(&view, &definition, consumer, AccessCheck::Granted, None)
        };
        assert!(!evaluate());
        limit.deactivate(false).unwrap();
        assert!(evaluate());
        limit.activate(false).unwrap();
        reading.set_value(19.0, consumer).unwrap();
        assert!(evaluate());
    }

    #[test]
    fn required_access_and_panicking_predicates() {
        let graph = test_graph();
        let consumer = ConsumerId::new();
        let rival = ConsumerId::new();
        let definition = PatternDefinition::builder("switch", "OnOffSwitch")
            .condition(
                Condition::new("control", "Boolean")
                    .child("stateControl")
                    .requires_access(AccessMode::Exclusive),
            )
            .accept(|view| {
                if view.value("control") == Some(&ResourceValue::Boolean(true)) {
                    panic!("refusing switched-on devices");
                }
                view.is_active("control")
            })
            .build(&graph.types())
            .unwrap();
        let switch = graph
            .top_level("switch", "OnOffSwitch")
            .unwrap()
            .create()
            .unwrap();
        let control = switch.sub_resource("stateControl").unwrap().create().unwrap();
        switch.activate(true).unwrap();

        let evaluate = || {
            let view = graph.view();
            let root = view.resource_id(switch.path()).unwrap();
            let mut core = InstanceCore::new(root, &definition);
            core.bind_detached(&view, &definition);
            core.evaluate(&view, &definition, consumer, AccessCheck::Granted, None)
        };
        assert!(!evaluate());
        control
            .request_access_mode(consumer, AccessMode::Exclusive, AccessPriority::Lowest)
            .unwrap();
        assert!(evaluate());
        control
            .request_access_mode(rival, AccessMode::Exclusive, AccessPriority::Highest)
            .unwrap();
        assert!(!evaluate());
        control
            .request_access_mode(rival, AccessMode::ReadOnly, AccessPriority::Highest)
            .unwrap();
        assert!(evaluate());
        control.set_value(true, consumer).unwrap();
        assert!(!evaluate());
    }
}
