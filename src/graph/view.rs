use parking_lot::{ArcRwLockReadGuard, RawRwLock};
use std::{cell::Cell, marker::PhantomData, sync::Arc};

use crate::{
    access::AccessTable,
    dispatch::{Dispatcher, Listener, Scope},
    error::PatternError,
    graph::{
        arena::{Arena, Lookup, NodeKind},
        base::GraphState,
    },
    model::{TypeName, TypeRegistry},
    paths::ResourcePath,
    properties::{AccessMode, AccessPriority, ConsumerId, ListenerId, ResourceId, ResourceValue},
};

/// Read snapshot of a [crate::graph::ResourceGraph]. Holds the graph's read section: no mutation
/// commits while a view is alive.
///
/// Listeners registered through a view are guaranteed to see every event published after the
/// state the view shows.
///
/// A view stays on the thread that took it, which lets mutations detect a view held by their
/// own thread instead of deadlocking on it.
pub struct GraphView {
    state: ArcRwLockReadGuard<RawRwLock, GraphState>,
    dispatcher: Arc<Dispatcher>,
    _thread_bound: PhantomData<*const ()>,
}

thread_local! {
    static VIEWS_HELD: Cell<usize> = const { Cell::new(0) };
}

/// Number of views alive on the current thread.
pub(crate) fn views_held() -> usize {
    VIEWS_HELD.with(|held| held.get())
}

impl Drop for GraphView {
    fn drop(&mut self) {
        VIEWS_HELD.with(|held| held.set(held.get().saturating_sub(1)));
    }
}

impl GraphView {
    pub(crate) fn new(
        state: ArcRwLockReadGuard<RawRwLock, GraphState>,
        dispatcher: Arc<Dispatcher>,
    ) -> GraphView {
        VIEWS_HELD.with(|held| held.set(held.get() + 1));
        GraphView {
            state,
            dispatcher,
            _thread_bound: PhantomData,
        }
    }

    pub(crate) fn arena(&self) -> &Arena {
        &self.state.arena
    }

    pub(crate) fn access(&self) -> &AccessTable {
        &self.state.access
    }

    pub(crate) fn listen(&self, scope: Scope, listener: Listener) -> ListenerId {
        self.dispatcher.add_listener(scope, listener)
    }

    pub(crate) fn unlisten(&self, id: ListenerId) -> bool {
        self.dispatcher.remove_listener(id)
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.state.types
    }

    pub(crate) fn lookup(&self, path: &ResourcePath) -> Lookup {
        self.state.arena.lookup(path)
    }

    /// The record at `path` (a reference record if the last segment is a reference).
    pub fn resource_id(&self, path: &ResourcePath) -> Option<ResourceId> {
        match self.lookup(path) {
            Lookup::Found { node, .. } => Some(node),
            _ => None,
        }
    }

    pub(crate) fn require(&self, path: &ResourcePath) -> Result<ResourceId, PatternError> {
        self.resource_id(path)
            .ok_or_else(|| PatternError::NotFound(path.to_string()))
    }

    pub(crate) fn require_real(&self, path: &ResourcePath) -> Result<ResourceId, PatternError> {
        match self.lookup(path) {
            Lookup::Found { real, .. } => Ok(real),
            _ => Err(PatternError::NotFound(path.to_string())),
        }
    }

    pub fn exists(&self, path: &ResourcePath) -> bool {
        matches!(self.lookup(path), Lookup::Found { .. })
    }

    pub fn is_active(&self, path: &ResourcePath) -> bool {
        match self.lookup(path) {
            Lookup::Found { real, .. } => self.state.arena.is_active(real),
            _ => false,
        }
    }

    pub fn is_reference(&self, path: &ResourcePath) -> bool {
        match self.lookup(path) {
            Lookup::Found { node, .. } => self
                .state
                .arena
                .get(node)
                .map(|n| n.is_reference())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Canonical path of the real resource `path` resolves to.
    pub fn location(&self, path: &ResourcePath) -> Option<ResourcePath> {
        match self.lookup(path) {
            Lookup::Found { real, .. } => Some(self.state.arena.own_path(real)),
            _ => None,
        }
    }

    /// True if both paths exist and resolve to the same real resource.
    pub fn equals_location(&self, a: &ResourcePath, b: &ResourcePath) -> bool {
        match (self.lookup(a), self.lookup(b)) {
            (Lookup::Found { real: ra, .. }, Lookup::Found { real: rb, .. }) => ra == rb,
            _ => false,
        }
    }

    pub fn type_of(&self, path: &ResourcePath) -> Option<TypeName> {
        match self.lookup(path) {
            Lookup::Found { real, .. } => self.state.type_of(real).cloned(),
            _ => None,
        }
    }

    pub fn value(&self, path: &ResourcePath) -> Option<ResourceValue> {
        match self.lookup(path) {
            Lookup::Found { real, .. } => self.state.arena.value(real).cloned(),
            _ => None,
        }
    }

    /// Paths of the direct children (real or reference) of the resource at `path`, seen through
    /// `path` itself.
    /// Children of `path`. The root path lists the top-level resources.
    pub fn sub_resources(&self, path: &ResourcePath) -> Vec<ResourcePath> {
        if path.is_root() {
            return self.top_level_resources();
        }
        let Lookup::Found { real, .. } = self.lookup(path) else {
            return Vec::new();
        };
        self.state
            .arena
            .children(real)
            .into_iter()
            .filter_map(|child| self.state.arena.get(child))
            .filter_map(|child| path.child(&child.name).ok())
            .collect()
    }

    pub fn top_level_resources(&self) -> Vec<ResourcePath> {
        self.state
            .arena
            .top_level()
            .map(|id| self.state.arena.own_path(id))
            .collect()
    }

    /// Locations of all real resources whose type is `type_name` or one of its subtypes.
    pub fn resources_of_type(&self, type_name: &TypeName) -> Vec<ResourcePath> {
        self.real_ids_of_type(type_name)
            .into_iter()
            .map(|id| self.state.arena.own_path(id))
            .collect()
    }

    pub(crate) fn real_ids_of_type(&self, type_name: &TypeName) -> Vec<ResourceId> {
        self.state
            .arena
            .nodes()
            .filter(|node| matches!(node.kind, NodeKind::Real { .. }))
            .filter(|node| self.state.types.is_a(&node.type_name, type_name))
            .map(|node| node.id)
            .collect()
    }

    pub fn access_mode(&self, path: &ResourcePath, consumer: &ConsumerId) -> AccessMode {
        match self.lookup(path) {
            Lookup::Found { real, .. } => self.state.access.mode(real, consumer),
            _ => AccessMode::None,
        }
    }

    /// Priority of the outstanding request of `consumer`, if any.
    pub fn access_priority(
        &self,
        path: &ResourcePath,
        consumer: &ConsumerId,
    ) -> Option<AccessPriority> {
        match self.lookup(path) {
            Lookup::Found { real, .. } => self
                .state
                .access
                .requested(real, consumer)
                .map(|request| request.priority),
            _ => None,
        }
    }
}
