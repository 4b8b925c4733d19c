use enumset::EnumSet;
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use crate::{
    access::AccessTable,
    config::EngineConfig,
    dispatch::{Dispatcher, FaultSink, Listener, Scope},
    error::PatternError,
    event::{ResourceEvent, StructureEventKind},
    graph::{
        arena::{Arena, Lookup, NodeKind},
        resource::Resource,
        view::{self, GraphView},
    },
    model::{TypeDef, TypeName, TypeRegistry},
    paths::ResourcePath,
    properties::{
        AccessMode, AccessPriority, ConsumerId, ListenerId, ResourceId, ResourceValue, ValueKind,
    },
};

/// Events produced by one mutation, each with the records it is delivered for.
pub(crate) type Outbox = Vec<(ResourceEvent, Vec<ResourceId>)>;

#[derive(Debug)]
pub(crate) struct GraphState {
    pub(crate) arena: Arena,
    pub(crate) types: TypeRegistry,
    pub(crate) access: AccessTable,
}

impl GraphState {
    fn emit(
        &self,
        out: &mut Outbox,
        kind: StructureEventKind,
        resource: ResourceId,
        related: Option<ResourceId>,
    ) {
        let event = ResourceEvent::Structure {
            kind,
            resource,
            path: self.arena.own_path(resource),
            related,
        };
        out.push((event, self.arena.event_targets(resource)));
    }

    pub(crate) fn type_of(&self, id: ResourceId) -> Option<&TypeName> {
        self.arena.get(self.arena.deref(id)).map(|n| &n.type_name)
    }

    fn require_real(&self, path: &ResourcePath) -> Result<ResourceId, PatternError> {
        match self.arena.lookup(path) {
            Lookup::Found { real, .. } => Ok(real),
            _ => Err(PatternError::NotFound(path.to_string())),
        }
    }

    /// Type a missing resource at `path` gets when it is created implicitly: the declared element
    /// type of its (possibly also missing) parent.
    fn inferred_type(&self, path: &ResourcePath) -> Result<TypeName, PatternError> {
        if let Lookup::Found { real, .. } = self.arena.lookup(path) {
            if let Some(type_name) = self.type_of(real) {
                return Ok(type_name.clone());
            }
        }
        let (Some(name), Some(parent)) = (path.name(), path.parent()) else {
            return Err(PatternError::Usage("the root path is not a resource".to_string()));
        };
        if parent.is_root() {
            return Err(PatternError::NotFound(format!(
                "{path} does not exist and its type cannot be inferred"
            )));
        }
        let parent_type = self.inferred_type(&parent)?;
        self.types
            .element_type(&parent_type, name)
            .cloned()
            .ok_or_else(|| {
                PatternError::Usage(format!(
                    "'{name}' is not a declared element of {parent_type}; create {path} explicitly"
                ))
            })
    }

    fn deepest_existing(&self, path: &ResourcePath) -> Option<ResourceId> {
        let mut current = Some(path.clone());
        while let Some(candidate) = current {
            if let Lookup::Found { real, .. } = self.arena.lookup(&candidate) {
                return Some(real);
            }
            current = candidate.parent();
        }
        None
    }

    pub(crate) fn create(
        &mut self,
        path: &ResourcePath,
        type_name: &TypeName,
        out: &mut Outbox,
    ) -> Result<ResourceId, PatternError> {
        self.types.require(type_name)?;
        match self.arena.lookup(path) {
            Lookup::Found { node, real } => {
                let existing = self.type_of(real).cloned().unwrap_or_else(TypeName::base);
                if self.types.is_a(&existing, type_name) {
                    Ok(node)
                } else {
                    Err(PatternError::TypeMismatch {
                        expected: type_name.to_string(),
                        found: format!("{existing} at {path}"),
                    })
                }
            }
            Lookup::Virtual { parent } => self.insert_real(parent, path, type_name, out),
            Lookup::Unresolved => {
                let Some(parent_path) = path.parent() else {
                    return Err(PatternError::Usage("the root path is not a resource".to_string()));
                };
                let parent_type = self.inferred_type(&parent_path)?;
                if let Some(name) = path.name() {
                    self.types.check_child(&parent_type, name, type_name)?;
                }
                self.create(&parent_path, &parent_type, out)?;
                self.create(path, type_name, out)
            }
        }
    }

    fn insert_real(
        &mut self,
        parent: Option<ResourceId>,
        path: &ResourcePath,
        type_name: &TypeName,
        out: &mut Outbox,
    ) -> Result<ResourceId, PatternError> {
        let Some(name) = path.name() else {
            return Err(PatternError::Usage("the root path is not a resource".to_string()));
        };
        if let Some(parent_type) = parent.and_then(|p| self.type_of(p)) {
            self.types.check_child(parent_type, name, type_name)?;
        }
        let value = self
            .types
            .value_kind(type_name)
            .map(ResourceValue::default_for);
        let id = self.arena.insert(
            parent,
            name,
            type_name.clone(),
            NodeKind::Real {
                active: false,
                value,
                children: BTreeMap::new(),
            },
        );
        tracing::debug!("Created {path} ({id}) of type {type_name}");
        self.emit(out, StructureEventKind::Created, id, None);
        if let Some(parent) = parent {
            self.emit(out, StructureEventKind::SubresourceAdded, parent, Some(id));
        }
        Ok(id)
    }

    pub(crate) fn delete(
        &mut self,
        path: &ResourcePath,
        out: &mut Outbox,
    ) -> Result<bool, PatternError> {
        match self.arena.lookup(path) {
            Lookup::Found { node, .. } => {
                self.delete_node(node, out);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete_node(&mut self, id: ResourceId, out: &mut Outbox) {
        let Some(node) = self.arena.get(id) else {
            return;
        };
        let parent = node.parent;
        if node.is_reference() {
            tracing::debug!("Removing reference {}", self.arena.own_path(id));
            self.emit(out, StructureEventKind::ReferenceRemoved, id, None);
            self.emit(out, StructureEventKind::Deleted, id, None);
            self.arena.remove(id);
        } else {
            tracing::debug!("Deleting {} and its subtree", self.arena.own_path(id));
            let subtree = self.arena.subtree_post_order(id);
            let members: BTreeSet<ResourceId> = subtree.iter().copied().collect();
            // references into the subtree would dangle
            let dangling: Vec<ResourceId> = subtree
                .iter()
                .flat_map(|n| self.arena.referrers(*n))
                .filter(|r| !members.contains(r))
                .collect();
            for reference in dangling {
                self.delete_node(reference, out);
            }
            for member in &subtree {
                self.emit(out, StructureEventKind::Deleted, *member, None);
            }
            for member in &subtree {
                self.access.forget(*member);
                self.arena.remove(*member);
            }
        }
        if let Some(parent) = parent.filter(|p| self.arena.contains(*p)) {
            self.emit(out, StructureEventKind::SubresourceRemoved, parent, Some(id));
        }
    }

    pub(crate) fn set_active(
        &mut self,
        path: &ResourcePath,
        flag: bool,
        recursive: bool,
        out: &mut Outbox,
    ) -> Result<(), PatternError> {
        let real = self.require_real(path)?;
        let mut order = match recursive {
            true => self.arena.subtree_post_order(real),
            false => vec![real],
        };
        if flag {
            // parents before children
            order.reverse();
        }
        let kind = match flag {
            true => StructureEventKind::Activated,
            false => StructureEventKind::Deactivated,
        };
        for id in order {
            if self.arena.set_active(id, flag) {
                self.emit(out, kind, id, None);
            }
        }
        Ok(())
    }

    pub(crate) fn set_as_reference(
        &mut self,
        slot: &ResourcePath,
        target: &ResourcePath,
        out: &mut Outbox,
    ) -> Result<ResourceId, PatternError> {
        let (Some(name), Some(parent_path)) = (slot.name(), slot.parent()) else {
            return Err(PatternError::Usage("the root path is not a resource".to_string()));
        };
        if parent_path.is_root() {
            return Err(PatternError::Usage(format!(
                "top-level resource {slot} cannot be a reference"
            )));
        }
        let target_real = self.require_real(target)?;
        let target_type = self.type_of(target_real).cloned().unwrap_or_else(TypeName::base);
        let parent_type = self.inferred_type(&parent_path)?;
        self.types.check_child(&parent_type, name, &target_type)?;
        if let Some(anchor) = self.deepest_existing(&parent_path) {
            if self.arena.reaches(target_real, anchor) {
                return Err(PatternError::ReferenceCycle {
                    reference: slot.to_string(),
                    target: target.to_string(),
                });
            }
        }

        let parent = match self.arena.lookup(&parent_path) {
            Lookup::Found { real, .. } => Some(real),
            _ => None,
        };
        if let Some(existing) = parent.and_then(|p| self.arena.child(p, name)) {
            let current_target = match self.arena.get(existing).map(|n| &n.kind) {
                Some(NodeKind::Reference { target }) => Some(*target),
                _ => None,
            };
            match current_target {
                Some(current) => {
                    if current != target_real {
                        tracing::debug!("Redirecting reference {slot} to {target}");
                        self.arena.retarget(existing, target_real, target_type);
                        self.emit(
                            out,
                            StructureEventKind::ReferenceAdded,
                            existing,
                            Some(target_real),
                        );
                    }
                    return Ok(existing);
                }
                None => {
                    if self.arena.subtree_post_order(existing).contains(&target_real) {
                        return Err(PatternError::Usage(format!(
                            "{target} lies below {slot} and would be deleted by replacing it"
                        )));
                    }
                    self.delete_node(existing, out);
                }
            }
        }
        let parent = match parent {
            Some(parent) => parent,
            None => {
                let created = self.create(&parent_path, &parent_type, out)?;
                self.arena.deref(created)
            }
        };
        let id = self.arena.insert(
            Some(parent),
            name,
            target_type,
            NodeKind::Reference {
                target: target_real,
            },
        );
        tracing::debug!("Set {slot} ({id}) as reference to {target}");
        self.emit(out, StructureEventKind::Created, id, None);
        self.emit(out, StructureEventKind::ReferenceAdded, id, Some(target_real));
        self.emit(out, StructureEventKind::SubresourceAdded, parent, Some(id));
        Ok(id)
    }

    pub(crate) fn set_value(
        &mut self,
        path: &ResourcePath,
        value: ResourceValue,
        consumer: ConsumerId,
        out: &mut Outbox,
    ) -> Result<bool, PatternError> {
        let real = self.require_real(path)?;
        let type_name = self.type_of(real).cloned().unwrap_or_else(TypeName::base);
        let kind = self
            .types
            .value_kind(&type_name)
            .ok_or_else(|| PatternError::TypeMismatch {
                expected: "a value resource".to_string(),
                found: type_name.to_string(),
            })?;
        let value = coerce(value, kind)?;
        let mode = self.access.mode(real, &consumer);
        if !mode.can_write() {
            return Err(PatternError::AccessDenied(format!(
                "consumer {consumer} holds {mode} on {path}"
            )));
        }
        let changed = self.arena.set_value(real, value.clone());
        let event = ResourceEvent::Value {
            resource: real,
            path: self.arena.own_path(real),
            value,
            changed,
        };
        out.push((event, self.arena.event_targets(real)));
        Ok(changed)
    }

    /// Files an access request on a real record. Returns whether the requested mode is granted.
    pub(crate) fn request_access(
        &mut self,
        real: ResourceId,
        consumer: ConsumerId,
        mode: AccessMode,
        priority: AccessPriority,
        out: &mut Outbox,
    ) -> bool {
        if !self.arena.contains(real) {
            return false;
        }
        for change in self.access.request(real, consumer, mode, priority) {
            tracing::trace!(
                "Access of {} on {} is now {}",
                change.consumer,
                change.resource,
                change.mode
            );
            let event = ResourceEvent::AccessModeChanged {
                resource: change.resource,
                path: self.arena.own_path(change.resource),
                consumer: change.consumer,
                mode: change.mode,
            };
            out.push((event, self.arena.event_targets(change.resource)));
        }
        !mode.can_write() || self.access.mode(real, &consumer).satisfies(mode)
    }
}

fn coerce(value: ResourceValue, kind: ValueKind) -> Result<ResourceValue, PatternError> {
    match (value, kind) {
        (ResourceValue::Integer(i), ValueKind::Float) => Ok(ResourceValue::Float(i as f64)),
        (value, kind) if value.kind() == kind => Ok(value),
        (value, kind) => Err(PatternError::TypeMismatch {
            expected: kind.to_string(),
            found: value.kind().to_string(),
        }),
    }
}

/// The shared, typed resource graph.
///
/// Cloning is cheap and yields another handle to the same graph. Mutations are serialized by a
/// single write section and publish their events to the graph's [Dispatcher] before the section
/// ends; they return without waiting for listeners to run.
#[derive(Clone)]
pub struct ResourceGraph {
    state: Arc<RwLock<GraphState>>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<EngineConfig>,
}

impl std::fmt::Debug for ResourceGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGraph")
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl ResourceGraph {
    pub fn new(types: TypeRegistry) -> Result<ResourceGraph, PatternError> {
        ResourceGraph::with_config(types, EngineConfig::default())
    }

    pub fn with_config(
        types: TypeRegistry,
        config: EngineConfig,
    ) -> Result<ResourceGraph, PatternError> {
        let dispatcher = Arc::new(Dispatcher::new(&config.dispatcher)?);
        Ok(ResourceGraph {
            state: Arc::new(RwLock::new(GraphState {
                arena: Arena::default(),
                types,
                access: AccessTable::default(),
            })),
            dispatcher,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn set_fault_sink(&self, sink: Arc<dyn FaultSink>) {
        self.dispatcher.set_fault_sink(sink);
    }

    /// A consistent read snapshot. The graph cannot be mutated while the view is alive: mutating
    /// calls made by the thread holding it fail with [PatternError::Usage].
    pub fn view(&self) -> GraphView {
        GraphView::new(self.state.read_arc(), self.dispatcher.clone())
    }

    /// A handle to the (possibly virtual) resource at `path`.
    pub fn resource(&self, path: &ResourcePath) -> Resource {
        Resource::new(self.clone(), path.clone(), None)
    }

    /// A handle to the (possibly virtual) top-level resource `name` of type `type_name`.
    pub fn top_level(&self, name: &str, type_name: &str) -> Result<Resource, PatternError> {
        Ok(Resource::new(
            self.clone(),
            ResourcePath::top_level(name)?,
            Some(TypeName::new(type_name)),
        ))
    }

    /// Taking the write section while this thread holds a [GraphView] would block forever.
    fn check_no_view() -> Result<(), PatternError> {
        match view::views_held() {
            0 => Ok(()),
            held => Err(PatternError::Usage(format!(
                "the graph cannot be mutated while this thread holds {held} view(s) of it"
            ))),
        }
    }

    fn mutate<T, F>(&self, f: F) -> Result<T, PatternError>
    where
        F: FnOnce(&mut GraphState, &mut Outbox) -> Result<T, PatternError>,
    {
        ResourceGraph::check_no_view()?;
        let mut state = self.state.write();
        let mut out = Outbox::new();
        let result = f(&mut state, &mut out);
        self.dispatcher.publish_batch(out)?;
        result
    }

    pub fn register_type(&self, def: TypeDef) -> Result<(), PatternError> {
        ResourceGraph::check_no_view()?;
        self.state.write().types.register(def)
    }

    pub fn types(&self) -> TypeRegistry {
        self.state.read().types.clone()
    }

    /// Creates the resource at `path` (and any missing ancestor, typed after the declared elements
    /// of its parent). Existing resources of a compatible type are returned unchanged.
    pub fn create(
        &self,
        path: &ResourcePath,
        type_name: &TypeName,
    ) -> Result<ResourceId, PatternError> {
        self.mutate(|state, out| state.create(path, type_name, out))
    }

    pub fn add_decorator(
        &self,
        parent: &ResourcePath,
        name: &str,
        type_name: &TypeName,
    ) -> Result<ResourceId, PatternError> {
        let path = parent.child(name)?;
        self.mutate(|state, out| {
            state.require_real(parent)?;
            state.create(&path, type_name, out)
        })
    }

    /// Deletes the resource at `path`. Returns false if nothing existed there.
    pub fn delete(&self, path: &ResourcePath) -> Result<bool, PatternError> {
        self.mutate(|state, out| state.delete(path, out))
    }

    pub fn activate(&self, path: &ResourcePath, recursive: bool) -> Result<(), PatternError> {
        self.mutate(|state, out| state.set_active(path, true, recursive, out))
    }

    pub fn deactivate(&self, path: &ResourcePath, recursive: bool) -> Result<(), PatternError> {
        self.mutate(|state, out| state.set_active(path, false, recursive, out))
    }

    pub fn set_as_reference(
        &self,
        slot: &ResourcePath,
        target: &ResourcePath,
    ) -> Result<ResourceId, PatternError> {
        self.mutate(|state, out| state.set_as_reference(slot, target, out))
    }

    /// Writes a value. Returns whether the stored value changed.
    pub fn set_value<V: Into<ResourceValue>>(
        &self,
        path: &ResourcePath,
        value: V,
        consumer: ConsumerId,
    ) -> Result<bool, PatternError> {
        let value = value.into();
        self.mutate(|state, out| state.set_value(path, value, consumer, out))
    }

    /// Requests `mode` for `consumer` on the location of `path`. Returns whether it is granted.
    pub fn request_access(
        &self,
        path: &ResourcePath,
        consumer: ConsumerId,
        mode: AccessMode,
        priority: AccessPriority,
    ) -> Result<bool, PatternError> {
        self.mutate(|state, out| {
            let real = state.require_real(path)?;
            Ok(state.request_access(real, consumer, mode, priority, out))
        })
    }

    pub(crate) fn request_access_at(
        &self,
        real: ResourceId,
        consumer: ConsumerId,
        mode: AccessMode,
        priority: AccessPriority,
    ) -> Result<bool, PatternError> {
        self.mutate(|state, out| Ok(state.request_access(real, consumer, mode, priority, out)))
    }

    /// Listens to the structure events of `kinds` on the record at `path`. Pass
    /// `EnumSet::all()` for every kind.
    pub fn add_structure_listener<F>(
        &self,
        path: &ResourcePath,
        kinds: EnumSet<StructureEventKind>,
        listener: F,
    ) -> Result<ListenerId, PatternError>
    where
        F: Fn(&ResourceEvent) + Send + Sync + 'static,
    {
        let view = self.view();
        let resource = view.require(path)?;
        Ok(view.listen(Scope::Structure { resource, kinds }, Arc::new(listener)))
    }

    pub fn add_value_listener<F>(
        &self,
        path: &ResourcePath,
        every_update: bool,
        listener: F,
    ) -> Result<ListenerId, PatternError>
    where
        F: Fn(&ResourceEvent) + Send + Sync + 'static,
    {
        let view = self.view();
        let resource = view.require_real(path)?;
        Ok(view.listen(
            Scope::Value {
                resource,
                every_update,
            },
            Arc::new(listener),
        ))
    }

    /// Listens to access mode changes on the location of `path`, for one consumer or for all.
    pub fn add_access_mode_listener<F>(
        &self,
        path: &ResourcePath,
        consumer: Option<ConsumerId>,
        listener: F,
    ) -> Result<ListenerId, PatternError>
    where
        F: Fn(&ResourceEvent) + Send + Sync + 'static,
    {
        let view = self.view();
        let resource = view.require_real(path)?;
        Ok(view.listen(Scope::AccessMode { resource, consumer }, Arc::new(listener)))
    }

    /// Listens to the structure events of `kinds` anywhere in the graph.
    pub fn add_global_structure_listener(
        &self,
        kinds: EnumSet<StructureEventKind>,
        listener: Listener,
    ) -> ListenerId {
        self.dispatcher
            .add_listener(Scope::AllStructure { kinds }, listener)
    }

    pub fn remove_structure_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.remove_listener_if(id, |scope| {
            matches!(scope, Scope::Structure { .. } | Scope::AllStructure { .. })
        })
    }

    pub fn remove_value_listener(&self, id: ListenerId) -> bool {
        self.dispatcher
            .remove_listener_if(id, |scope| matches!(scope, Scope::Value { .. }))
    }

    pub fn remove_access_mode_listener(&self, id: ListenerId) -> bool {
        self.dispatcher
            .remove_listener_if(id, |scope| matches!(scope, Scope::AccessMode { .. }))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.remove_listener(id)
    }

    /// Runs `task` on the dispatch thread once every event published so far was delivered.
    pub fn submit<F>(&self, label: &str, task: F) -> Result<(), PatternError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatcher.submit(label, task)
    }

    /// Waits until every published event has been delivered. See [Dispatcher::wait_idle].
    pub fn wait_idle(&self, timeout: Duration) -> Result<bool, PatternError> {
        self.dispatcher.wait_idle(timeout)
    }

    pub fn exists(&self, path: &ResourcePath) -> bool {
        self.view().exists(path)
    }

    pub fn is_active(&self, path: &ResourcePath) -> bool {
        self.view().is_active(path)
    }

    pub fn is_reference(&self, path: &ResourcePath) -> bool {
        self.view().is_reference(path)
    }

    pub fn location(&self, path: &ResourcePath) -> Option<ResourcePath> {
        self.view().location(path)
    }

    pub fn equals_location(&self, a: &ResourcePath, b: &ResourcePath) -> bool {
        self.view().equals_location(a, b)
    }

    pub fn value(&self, path: &ResourcePath) -> Option<ResourceValue> {
        self.view().value(path)
    }

    pub fn sub_resources(&self, path: &ResourcePath) -> Vec<ResourcePath> {
        self.view().sub_resources(path)
    }

    pub fn resources_of_type(&self, type_name: &TypeName) -> Vec<ResourcePath> {
        self.view().resources_of_type(type_name)
    }

    pub fn access_mode(&self, path: &ResourcePath, consumer: &ConsumerId) -> AccessMode {
        self.view().access_mode(path, consumer)
    }

    pub fn access_priority(
        &self,
        path: &ResourcePath,
        consumer: &ConsumerId,
    ) -> Option<AccessPriority> {
        self.view().access_priority(path, consumer)
    }
}
