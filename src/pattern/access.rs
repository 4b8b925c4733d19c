//! [PatternAccess]: the pattern demands of one consumer and the matcher driving their instances.
//!
//! Locks are always taken in the order matcher, graph, listener registry. Graph events reach the
//! matcher on the dispatch thread through listeners that only hold a weak reference to it, so
//! dropping the last [PatternAccess] handle tears everything down. Pattern callbacks are queued
//! as dispatcher tasks while the matcher lock is held, which keeps them in transition order and
//! runs them outside of every lock.
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Weak},
};

use crate::{
    dispatch::Listener,
    error::PatternError,
    event::{EventKind, ResourceEvent, StructureEventKind},
    graph::{GraphView, Lookup, ResourceGraph},
    paths::ResourcePath,
    pattern::{
        change::{ChangeHandle, ChangeWatch},
        definition::{Condition, Hop, PatternContext, PatternDefinition},
        instance::{AccessChanges, AccessCheck, InstanceCore, InstanceState, PatternInstance},
    },
    properties::{
        AccessMode, AccessPriority, ConsumerId, DemandId, IdSource, ListenerId, ResourceId,
    },
};

/// Receives availability transitions of the instances of a demand.
///
/// Callbacks run on the dispatch thread and may use the graph freely. For a given demand and
/// root resource they alternate strictly, starting with `available`.
pub trait PatternListener: Send + Sync {
    fn available(&self, instance: &PatternInstance);
    fn unavailable(&self, instance: &PatternInstance);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DemandHandle(pub(super) DemandId);

impl DemandHandle {
    pub fn id(&self) -> DemandId {
        self.0
    }
}

pub(super) struct Demand {
    pub(super) definition: Arc<PatternDefinition>,
    pub(super) listener: Arc<dyn PatternListener>,
    pub(super) priority: AccessPriority,
    /// Location of the single root of an individual demand.
    pub(super) scope: Option<ResourcePath>,
    pub(super) context: Option<PatternContext>,
    pub(super) instances: BTreeMap<ResourceId, InstanceCore>,
}

impl Demand {
    fn admits(&self, view: &GraphView, root: ResourceId) -> bool {
        let arena = view.arena();
        let Some(node) = arena.get(root) else {
            return false;
        };
        !node.is_reference()
            && view
                .types()
                .is_a(&node.type_name, self.definition.root_type())
            && self
                .scope
                .as_ref()
                .map(|scope| *scope == arena.own_path(root))
                .unwrap_or(true)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Hold {
    demand: DemandId,
    root: ResourceId,
    field: usize,
    mode: AccessMode,
    priority: AccessPriority,
}

/// Access held by the fields of all instances of this consumer, per resource location. The graph
/// keeps one request per (location, consumer), so the strongest hold is what gets requested.
#[derive(Debug, Default)]
struct AccessHolds {
    by_resource: BTreeMap<ResourceId, Vec<Hold>>,
}

impl AccessHolds {
    fn strongest(holds: &[Hold]) -> (AccessMode, AccessPriority) {
        holds
            .iter()
            .map(|hold| (hold.mode, hold.priority))
            .max()
            .unwrap_or((AccessMode::ReadOnly, AccessPriority::Lowest))
    }

    fn acquire(&mut self, resource: ResourceId, hold: Hold) -> (AccessMode, AccessPriority) {
        let holds = self.by_resource.entry(resource).or_default();
        holds.push(hold);
        AccessHolds::strongest(holds)
    }

    /// Returns the request to issue after the release, or None if no such hold existed.
    fn release(
        &mut self,
        resource: ResourceId,
        demand: DemandId,
        root: ResourceId,
        field: usize,
    ) -> Option<(AccessMode, AccessPriority)> {
        let holds = self.by_resource.get_mut(&resource)?;
        let position = holds
            .iter()
            .position(|h| h.demand == demand && h.root == root && h.field == field)?;
        holds.remove(position);
        let request = AccessHolds::strongest(holds);
        if holds.is_empty() {
            self.by_resource.remove(&resource);
        }
        Some(request)
    }
}

#[derive(Default)]
pub(super) struct Matcher {
    pub(super) demands: BTreeMap<DemandId, Demand>,
    holds: AccessHolds,
}

pub(super) struct Inner {
    pub(super) graph: ResourceGraph,
    pub(super) consumer: ConsumerId,
    pub(super) matcher: Mutex<Matcher>,
    me: Weak<Inner>,
    pub(super) ids: IdSource,
    discovery: OnceCell<ListenerId>,
    pub(super) changes: Mutex<BTreeMap<ChangeHandle, ChangeWatch>>,
}

/// Pattern access of one consumer. Cheap to clone; all clones share the same demands.
#[derive(Clone)]
pub struct PatternAccess {
    pub(super) inner: Arc<Inner>,
}

impl fmt::Debug for PatternAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternAccess")
            .field("consumer", &self.inner.consumer)
            .field("demands", &self.inner.matcher.lock().demands.len())
            .finish()
    }
}

impl PatternAccess {
    pub fn new(graph: &ResourceGraph, consumer: ConsumerId) -> PatternAccess {
        let inner = Arc::new_cyclic(|me| Inner {
            graph: graph.clone(),
            consumer,
            matcher: Mutex::new(Matcher::default()),
            me: me.clone(),
            ids: IdSource::default(),
            discovery: OnceCell::new(),
            changes: Mutex::new(BTreeMap::new()),
        });
        let weak = Arc::downgrade(&inner);
        let discovery = graph.add_global_structure_listener(
            StructureEventKind::Created.into(),
            Arc::new(move |event: &ResourceEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.discover(event);
                }
            }),
        );
        inner.discovery.get_or_init(|| discovery);
        PatternAccess { inner }
    }

    pub fn consumer(&self) -> ConsumerId {
        self.inner.consumer
    }

    pub fn graph(&self) -> &ResourceGraph {
        &self.inner.graph
    }

    /// Registers `listener` for every instance of `definition` in the graph, now and later.
    /// Fields requiring access request it at `priority`.
    pub fn add_pattern_demand<L>(
        &self,
        definition: &Arc<PatternDefinition>,
        listener: L,
        priority: AccessPriority,
    ) -> Result<DemandHandle, PatternError>
    where
        L: PatternListener + 'static,
    {
        self.inner
            .register(definition, Arc::new(listener), priority, None, None)
    }

    /// Like [PatternAccess::add_pattern_demand]; the acceptance predicate of `definition` sees
    /// `context` through [crate::pattern::PatternView::context] for the instances of this demand.
    pub fn add_pattern_demand_with_context<L>(
        &self,
        definition: &Arc<PatternDefinition>,
        listener: L,
        priority: AccessPriority,
        context: PatternContext,
    ) -> Result<DemandHandle, PatternError>
    where
        L: PatternListener + 'static,
    {
        self.inner
            .register(definition, Arc::new(listener), priority, None, Some(context))
    }

    /// [PatternAccess::add_pattern_demand] at the configured default priority.
    pub fn add_pattern_demand_default<L>(
        &self,
        definition: &Arc<PatternDefinition>,
        listener: L,
    ) -> Result<DemandHandle, PatternError>
    where
        L: PatternListener + 'static,
    {
        let priority = self.inner.graph.config().matcher.default_priority;
        self.add_pattern_demand(definition, listener, priority)
    }

    /// A demand matching only the resource at the location of `root`.
    pub fn add_individual_pattern_demand<L>(
        &self,
        definition: &Arc<PatternDefinition>,
        root: &ResourcePath,
        listener: L,
        priority: AccessPriority,
    ) -> Result<DemandHandle, PatternError>
    where
        L: PatternListener + 'static,
    {
        let scope = self
            .inner
            .graph
            .location(root)
            .unwrap_or_else(|| root.clone());
        self.inner
            .register(definition, Arc::new(listener), priority, Some(scope), None)
    }

    /// Removes a demand with all its instances, listeners and access requests. No callbacks
    /// fire. Returns false for unknown handles.
    pub fn remove_pattern_demand(&self, handle: DemandHandle) -> bool {
        self.inner.remove_demand(handle.0)
    }

    /// Removes every demand.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Activates every existing resource bound by a required field.
    pub fn activate_pattern(&self, instance: &PatternInstance) -> Result<(), PatternError> {
        for path in required_paths(instance) {
            match self.inner.graph.activate(path, false) {
                Err(PatternError::NotFound(_)) => {
                    tracing::trace!("Not activating {path}: it no longer exists")
                }
                other => other?,
            }
        }
        Ok(())
    }

    /// Deactivates every existing resource bound by a required field.
    pub fn deactivate_pattern(&self, instance: &PatternInstance) -> Result<(), PatternError> {
        for path in required_paths(instance).into_iter().rev() {
            match self.inner.graph.deactivate(path, false) {
                Err(PatternError::NotFound(_)) => {
                    tracing::trace!("Not deactivating {path}: it no longer exists")
                }
                other => other?,
            }
        }
        Ok(())
    }

    /// Creates a resource of the root type at `path` plus every required field reachable
    /// through child hops. Everything is created inactive.
    pub fn create_pattern(
        &self,
        path: &ResourcePath,
        definition: &Arc<PatternDefinition>,
    ) -> Result<PatternInstance, PatternError> {
        self.inner.graph.create(path, definition.root_type())?;
        self.inner
            .create_fields(path, definition, FieldSelection::Required)
    }

    /// Like [PatternAccess::create_pattern], with the root created as decorator `name` of
    /// `parent`.
    pub fn add_decorator_pattern(
        &self,
        parent: &ResourcePath,
        name: &str,
        definition: &Arc<PatternDefinition>,
    ) -> Result<PatternInstance, PatternError> {
        self.inner
            .graph
            .add_decorator(parent, name, definition.root_type())?;
        self.inner
            .create_fields(&parent.child(name)?, definition, FieldSelection::Required)
    }

    /// Creates the missing optional fields of an instance. Unless `create_all` is set, optional
    /// fields navigated from a field that does not exist yet are left out.
    pub fn create_optional_fields(
        &self,
        instance: &PatternInstance,
        definition: &Arc<PatternDefinition>,
        create_all: bool,
    ) -> Result<PatternInstance, PatternError> {
        check_pattern(instance, definition)?;
        if !self.inner.graph.exists(&instance.root) {
            return Err(PatternError::NotFound(instance.root.to_string()));
        }
        let selection = match create_all {
            true => FieldSelection::All,
            false => FieldSelection::AllFromExisting,
        };
        self.inner
            .create_fields(&instance.root, definition, selection)
    }

    /// Instances of `definition` that are complete right now. Nothing is registered and no
    /// access is requested; required access is checked as if requested at `priority`.
    pub fn get_patterns(
        &self,
        definition: &Arc<PatternDefinition>,
        priority: AccessPriority,
    ) -> Vec<PatternInstance> {
        self.complete_of_type(definition, priority, None)
    }

    /// [PatternAccess::get_patterns] with `context` handed to the acceptance predicate.
    pub fn get_patterns_with_context(
        &self,
        definition: &Arc<PatternDefinition>,
        priority: AccessPriority,
        context: &PatternContext,
    ) -> Vec<PatternInstance> {
        self.complete_of_type(definition, priority, Some(context))
    }

    fn complete_of_type(
        &self,
        definition: &Arc<PatternDefinition>,
        priority: AccessPriority,
        context: Option<&PatternContext>,
    ) -> Vec<PatternInstance> {
        let view = self.inner.graph.view();
        let roots = view.real_ids_of_type(definition.root_type());
        self.inner.complete_instances(
            &view,
            definition,
            roots,
            AccessCheck::Probe(priority),
            context,
        )
    }

    /// Like [PatternAccess::get_patterns], restricted to roots below `parent`: its direct
    /// children, or every descendant if `recursive`. References below `parent` are followed.
    pub fn get_subpatterns(
        &self,
        parent: &ResourcePath,
        definition: &Arc<PatternDefinition>,
        recursive: bool,
        priority: AccessPriority,
    ) -> Vec<PatternInstance> {
        let view = self.inner.graph.view();
        let mut roots = Vec::new();
        let mut pending = view.sub_resources(parent);
        while let Some(path) = pending.pop() {
            if let Lookup::Found { real, .. } = view.lookup(&path) {
                if !roots.contains(&real) {
                    roots.push(real);
                }
            }
            if recursive {
                pending.extend(view.sub_resources(&path));
            }
        }
        roots.sort();
        self.inner.complete_instances(
            &view,
            definition,
            roots,
            AccessCheck::Probe(priority),
            None,
        )
    }

    /// Whether the resource at `root` currently completes `definition` for this consumer,
    /// checking access against the grants it holds.
    pub fn is_satisfied(&self, root: &ResourcePath, definition: &Arc<PatternDefinition>) -> bool {
        self.satisfied_at(root, definition, None)
    }

    /// [PatternAccess::is_satisfied] with `context` handed to the acceptance predicate.
    pub fn is_satisfied_with_context(
        &self,
        root: &ResourcePath,
        definition: &Arc<PatternDefinition>,
        context: &PatternContext,
    ) -> bool {
        self.satisfied_at(root, definition, Some(context))
    }

    fn satisfied_at(
        &self,
        root: &ResourcePath,
        definition: &Arc<PatternDefinition>,
        context: Option<&PatternContext>,
    ) -> bool {
        let view = self.inner.graph.view();
        let Lookup::Found { real, .. } = view.lookup(root) else {
            return false;
        };
        !self
            .inner
            .complete_instances(&view, definition, vec![real], AccessCheck::Granted, context)
            .is_empty()
    }
}

fn required_paths(instance: &PatternInstance) -> Vec<&ResourcePath> {
    instance
        .fields
        .iter()
        .filter(|field| !field.optional && field.exists)
        .filter_map(|field| field.path.as_ref())
        .collect()
}

pub(super) fn check_pattern(
    instance: &PatternInstance,
    definition: &PatternDefinition,
) -> Result<(), PatternError> {
    if instance.pattern != definition.name() {
        return Err(PatternError::Usage(format!(
            "instance of pattern '{}' used with pattern '{}'",
            instance.pattern,
            definition.name()
        )));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FieldSelection {
    Required,
    All,
    /// Every field whose origin existed before the call.
    AllFromExisting,
}

impl Inner {
    fn register(
        &self,
        definition: &Arc<PatternDefinition>,
        listener: Arc<dyn PatternListener>,
        priority: AccessPriority,
        scope: Option<ResourcePath>,
        context: Option<PatternContext>,
    ) -> Result<DemandHandle, PatternError> {
        let id = DemandId(self.ids.next());
        let demand = Demand {
            definition: definition.clone(),
            listener,
            priority,
            scope,
            context,
            instances: BTreeMap::new(),
        };
        let mut matcher = self.matcher.lock();
        let roots: Vec<ResourceId> = {
            let view = self.graph.view();
            for condition in definition.fields() {
                view.types().require(&condition.type_name)?;
            }
            view.real_ids_of_type(definition.root_type())
                .into_iter()
                .filter(|root| demand.admits(&view, *root))
                .collect()
        };
        tracing::debug!(
            "Registering {id} for pattern '{}' at priority {priority}, {} candidate roots",
            definition.name(),
            roots.len()
        );
        matcher.demands.insert(id, demand);
        for root in roots {
            self.attach(&mut matcher, id, root);
        }
        Ok(DemandHandle(id))
    }

    fn remove_demand(&self, id: DemandId) -> bool {
        let mut guard = self.matcher.lock();
        let Matcher { demands, holds } = &mut *guard;
        let Some(mut demand) = demands.remove(&id) else {
            tracing::warn!("Ignoring removal of unknown {id}");
            return false;
        };
        let roots: Vec<ResourceId> = demand.instances.keys().copied().collect();
        for root in roots {
            self.remove_instance(holds, &mut demand, id, root, false);
        }
        tracing::debug!("Removed {id} (pattern '{}')", demand.definition.name());
        true
    }

    fn close(&self) {
        let ids: Vec<DemandId> = self.matcher.lock().demands.keys().copied().collect();
        for id in ids {
            self.remove_demand(id);
        }
    }

    /// Binds a new root for discovery on `CREATED` events.
    fn discover(&self, event: &ResourceEvent) {
        if event.structure_kind() != Some(StructureEventKind::Created) {
            return;
        }
        let resource = event.resource();
        let mut matcher = self.matcher.lock();
        let candidates: Vec<DemandId> = {
            let view = self.graph.view();
            matcher
                .demands
                .iter()
                .filter(|(_, demand)| {
                    !demand.instances.contains_key(&resource) && demand.admits(&view, resource)
                })
                .map(|(id, _)| *id)
                .collect()
        };
        for demand in candidates {
            self.attach(&mut matcher, demand, resource);
        }
    }

    fn attach(&self, matcher: &mut Matcher, demand_id: DemandId, root: ResourceId) {
        let Some(demand) = matcher.demands.get_mut(&demand_id) else {
            return;
        };
        let order = demand.definition.order().to_vec();
        demand
            .instances
            .insert(root, InstanceCore::new(root, &demand.definition));
        tracing::debug!(
            "{demand_id}: binding pattern '{}' to {root}",
            demand.definition.name()
        );
        self.refresh(matcher, demand_id, root, &order);
    }

    fn make_listener(&self, demand: DemandId, root: ResourceId) -> impl Fn(usize) -> Listener {
        let me = self.me.clone();
        move |field: usize| -> Listener {
            let me = me.clone();
            Arc::new(move |event: &ResourceEvent| {
                if let Some(inner) = me.upgrade() {
                    inner.on_field_event(demand, root, field, event);
                }
            })
        }
    }

    fn on_field_event(
        &self,
        demand_id: DemandId,
        root: ResourceId,
        field: usize,
        event: &ResourceEvent,
    ) {
        let mut matcher = self.matcher.lock();
        let affected = match matcher.demands.get(&demand_id) {
            Some(demand) if demand.instances.contains_key(&root) => {
                match event.kind() {
                    // only structure changes move bindings
                    EventKind::Structure => demand.definition.affected_by(field),
                    _ => Vec::new(),
                }
            }
            _ => {
                tracing::trace!("{demand_id}: ignoring {event} for a removed instance");
                return;
            }
        };
        tracing::trace!("{demand_id}: instance {root} field {field} saw {event}");
        self.refresh(&mut matcher, demand_id, root, &affected);
    }

    /// Rebinds `affected` fields of an instance, applies resulting access changes, re-evaluates
    /// and fires a callback if completeness flipped.
    fn refresh(
        &self,
        matcher: &mut Matcher,
        demand_id: DemandId,
        root: ResourceId,
        affected: &[usize],
    ) {
        let Matcher { demands, holds } = matcher;
        let Some(demand) = demands.get_mut(&demand_id) else {
            return;
        };
        let definition = demand.definition.clone();
        let listener = demand.listener.clone();
        let priority = demand.priority;
        let context = demand.context.clone();

        let mut view = self.graph.view();
        if !view.arena().contains(root) {
            drop(view);
            self.remove_instance(holds, demand, demand_id, root, true);
            return;
        }
        let Some(instance) = demand.instances.get_mut(&root) else {
            return;
        };
        let changes = instance.rebind(
            &view,
            &definition,
            self.consumer,
            affected,
            self.make_listener(demand_id, root),
        );
        if !changes.is_empty() {
            drop(view);
            self.apply_access(holds, demand_id, root, &definition, priority, changes);
            view = self.graph.view();
        }
        let complete = instance.evaluate(
            &view,
            &definition,
            self.consumer,
            AccessCheck::Granted,
            context.as_ref(),
        );
        match (instance.state, complete) {
            (InstanceState::Complete, true) | (InstanceState::Removed, _) => {}
            (_, true) => {
                let snapshot = instance.snapshot(&view, &definition, Some(demand_id));
                instance.state = InstanceState::Complete;
                instance.reported = Some(snapshot.clone());
                self.notify(demand_id, listener, snapshot, true);
            }
            (InstanceState::Complete, false) => {
                instance.state = InstanceState::Incomplete;
                let snapshot = instance
                    .reported
                    .take()
                    .unwrap_or_else(|| instance.snapshot(&view, &definition, Some(demand_id)));
                self.notify(demand_id, listener, snapshot, false);
            }
            (_, false) => instance.state = InstanceState::Incomplete,
        }
    }

    fn remove_instance(
        &self,
        holds: &mut AccessHolds,
        demand: &mut Demand,
        demand_id: DemandId,
        root: ResourceId,
        notify: bool,
    ) {
        let Some(mut instance) = demand.instances.remove(&root) else {
            return;
        };
        let was_complete = instance.state == InstanceState::Complete;
        let held = instance.release(self.graph.dispatcher(), &demand.definition);
        for (field, resource) in held {
            self.release_hold(holds, demand_id, root, field, resource);
        }
        tracing::debug!("{demand_id}: instance {root} removed");
        if notify && was_complete {
            if let Some(snapshot) = instance.reported.take() {
                self.notify(demand_id, demand.listener.clone(), snapshot, false);
            }
        }
    }

    fn apply_access(
        &self,
        holds: &mut AccessHolds,
        demand: DemandId,
        root: ResourceId,
        definition: &PatternDefinition,
        priority: AccessPriority,
        changes: AccessChanges,
    ) {
        for (field, resource) in changes.release {
            self.release_hold(holds, demand, root, field, resource);
        }
        for (field, resource) in changes.acquire {
            let Some(access) = definition.field(field).access else {
                continue;
            };
            let hold = Hold {
                demand,
                root,
                field,
                mode: access.mode,
                priority,
            };
            let (mode, priority) = holds.acquire(resource, hold);
            self.request(resource, mode, priority);
        }
    }

    fn release_hold(
        &self,
        holds: &mut AccessHolds,
        demand: DemandId,
        root: ResourceId,
        field: usize,
        resource: ResourceId,
    ) {
        if let Some((mode, priority)) = holds.release(resource, demand, root, field) {
            self.request(resource, mode, priority);
        }
    }

    fn request(&self, resource: ResourceId, mode: AccessMode, priority: AccessPriority) {
        match self
            .graph
            .request_access_at(resource, self.consumer, mode, priority)
        {
            Ok(granted) => tracing::trace!(
                "Requested {mode} on {resource} at {priority} for {}: granted {granted}",
                self.consumer
            ),
            Err(err) => tracing::warn!("Access request on {resource} failed: {err}"),
        }
    }

    fn notify(
        &self,
        demand: DemandId,
        listener: Arc<dyn PatternListener>,
        instance: PatternInstance,
        available: bool,
    ) {
        let transition = if available { "available" } else { "unavailable" };
        if self.graph.config().matcher.log_transitions {
            tracing::debug!(
                "{demand}: pattern '{}' at {} {transition}",
                instance.pattern,
                instance.root
            );
        }
        let label = format!("{demand} {transition} {}", instance.root);
        let result = self.graph.submit(&label, move || {
            if available {
                listener.available(&instance);
            } else {
                listener.unavailable(&instance);
            }
        });
        if let Err(err) = result {
            tracing::warn!("Could not queue {label}: {err}");
        }
    }

    fn create_fields(
        &self,
        root: &ResourcePath,
        definition: &Arc<PatternDefinition>,
        selection: FieldSelection,
    ) -> Result<PatternInstance, PatternError> {
        let fields = definition.fields();
        let mut paths: Vec<Option<ResourcePath>> = vec![None; fields.len()];
        let mut created = vec![false; fields.len()];
        paths[0] = Some(root.clone());
        for &i in definition.order().iter().filter(|&&i| i != 0) {
            let condition: &Condition = definition.field(i);
            let origin = definition.origin(i);
            let Some(origin_path) = paths[origin].clone() else {
                continue;
            };
            let mut target = origin_path;
            let mut navigable = true;
            for hop in &condition.hops {
                match hop {
                    Hop::Child(name) => target = target.child(name)?,
                    Hop::Parent | Hop::Location => navigable = false,
                }
            }
            if !navigable {
                continue;
            }
            let wanted = match selection {
                FieldSelection::Required => !condition.optional,
                FieldSelection::All => true,
                FieldSelection::AllFromExisting => !created[origin],
            };
            if self.graph.exists(&target) {
                paths[i] = Some(target);
            } else if wanted {
                self.graph.create(&target, &condition.type_name)?;
                tracing::debug!(
                    "Created field '{}' of pattern '{}' at {target}",
                    condition.name,
                    definition.name()
                );
                created[i] = true;
                paths[i] = Some(target);
            }
        }
        let view = self.graph.view();
        let real = view.require_real(root)?;
        let mut core = InstanceCore::new(real, definition);
        core.bind_detached(&view, definition);
        Ok(core.snapshot(&view, definition, None))
    }

    fn complete_instances(
        &self,
        view: &GraphView,
        definition: &PatternDefinition,
        roots: Vec<ResourceId>,
        check: AccessCheck,
        context: Option<&PatternContext>,
    ) -> Vec<PatternInstance> {
        roots
            .into_iter()
            .filter(|root| {
                view.arena()
                    .get(*root)
                    .map(|node| view.types().is_a(&node.type_name, definition.root_type()))
                    .unwrap_or(false)
            })
            .filter_map(|root| {
                let mut core = InstanceCore::new(root, definition);
                core.bind_detached(view, definition);
                core.evaluate(view, definition, self.consumer, check, context)
                    .then(|| core.snapshot(view, definition, None))
            })
            .collect()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(id) = self.discovery.get() {
            self.graph.remove_listener(*id);
        }
        let watches = std::mem::take(&mut *self.changes.lock());
        for watch in watches.into_values() {
            watch.release(&self.graph);
        }
        self.close();
    }
}
