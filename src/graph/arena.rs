use petgraph::{algo::has_path_connecting, graphmap::DiGraphMap};
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    model::TypeName,
    paths::ResourcePath,
    properties::{ResourceId, ResourceValue},
};

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum NodeKind {
    Real {
        active: bool,
        value: Option<ResourceValue>,
        children: BTreeMap<String, ResourceId>,
    },
    /// Non-owning alias of a real resource. Targets are always real records.
    Reference { target: ResourceId },
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Node {
    pub id: ResourceId,
    pub name: String,
    /// For references: the type of the target at the time the reference was set.
    pub type_name: TypeName,
    pub parent: Option<ResourceId>,
    pub kind: NodeKind,
}

impl Node {
    pub fn is_reference(&self) -> bool {
        matches!(self.kind, NodeKind::Reference { .. })
    }
}

/// Result of resolving a path against the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Lookup {
    /// `node` is the record at the path (possibly a reference), `real` the record it resolves to.
    Found { node: ResourceId, real: ResourceId },
    /// Only the last segment is missing; `parent` is the real record it would be created below
    /// (None for top-level resources).
    Virtual { parent: Option<ResourceId> },
    /// An intermediate segment is missing.
    Unresolved,
}

/// Arena of resource records. Ownership edges are the `children` maps of real records, reference
/// edges are kept separately in `referrers` (target -> referencing records).
#[derive(Debug, Default)]
pub(crate) struct Arena {
    nodes: BTreeMap<ResourceId, Node>,
    top: BTreeMap<String, ResourceId>,
    referrers: BTreeMap<ResourceId, BTreeSet<ResourceId>>,
    next_id: u64,
}

impl Arena {
    pub fn get(&self, id: ResourceId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn top_level(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.top.values().copied()
    }

    /// The real record `id` stands for.
    pub fn deref(&self, id: ResourceId) -> ResourceId {
        match self.nodes.get(&id).map(|n| &n.kind) {
            Some(NodeKind::Reference { target }) => *target,
            _ => id,
        }
    }

    pub fn child(&self, real: ResourceId, name: &str) -> Option<ResourceId> {
        match self.nodes.get(&real).map(|n| &n.kind) {
            Some(NodeKind::Real { children, .. }) => children.get(name).copied(),
            _ => None,
        }
    }

    pub fn children(&self, real: ResourceId) -> Vec<ResourceId> {
        match self.nodes.get(&real).map(|n| &n.kind) {
            Some(NodeKind::Real { children, .. }) => children.values().copied().collect(),
            _ => Vec::new(),
        }
    }

    pub fn referrers(&self, real: ResourceId) -> impl Iterator<Item = ResourceId> + '_ {
        self.referrers.get(&real).into_iter().flatten().copied()
    }

    pub fn is_active(&self, id: ResourceId) -> bool {
        match self.nodes.get(&self.deref(id)).map(|n| &n.kind) {
            Some(NodeKind::Real { active, .. }) => *active,
            _ => false,
        }
    }

    pub fn value(&self, id: ResourceId) -> Option<&ResourceValue> {
        match self.nodes.get(&self.deref(id)).map(|n| &n.kind) {
            Some(NodeKind::Real { value, .. }) => value.as_ref(),
            _ => None,
        }
    }

    pub fn lookup(&self, path: &ResourcePath) -> Lookup {
        let mut segments = path.segments().iter();
        let Some(first) = segments.next() else {
            return Lookup::Unresolved;
        };
        let Some(mut node) = self.top.get(first).copied() else {
            return match path.depth() {
                1 => Lookup::Virtual { parent: None },
                _ => Lookup::Unresolved,
            };
        };
        let mut remaining = path.depth() - 1;
        for segment in segments {
            remaining -= 1;
            let real = self.deref(node);
            match self.child(real, segment) {
                Some(child) => node = child,
                None if remaining == 0 => return Lookup::Virtual { parent: Some(real) },
                None => return Lookup::Unresolved,
            }
        }
        Lookup::Found {
            node,
            real: self.deref(node),
        }
    }

    /// The ownership path of a record. For a real record this is its location.
    pub fn own_path(&self, id: ResourceId) -> ResourcePath {
        let mut names = Vec::new();
        let mut current = self.nodes.get(&id);
        while let Some(node) = current {
            names.push(node.name.as_str());
            current = node.parent.and_then(|p| self.nodes.get(&p));
        }
        names.reverse();
        // names were validated on insertion
        names
            .into_iter()
            .try_fold(ResourcePath::root(), |path, name| path.child(name))
            .unwrap_or_default()
    }

    pub fn location(&self, id: ResourceId) -> ResourcePath {
        self.own_path(self.deref(id))
    }

    /// Records that receive the events of `id`: the record itself and, for real records, every
    /// reference currently pointing at it.
    pub fn event_targets(&self, id: ResourceId) -> Vec<ResourceId> {
        let mut targets = vec![id];
        targets.extend(self.referrers(id));
        targets
    }

    /// The owned subtree of `id` in post-order (children before their parent).
    pub fn subtree_post_order(&self, id: ResourceId) -> Vec<ResourceId> {
        let mut order = Vec::new();
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            stack.push((current, true));
            for child in self.children(current) {
                stack.push((child, false));
            }
        }
        order
    }

    /// True if `to` is reachable from `from` along ownership and reference edges.
    pub fn reaches(&self, from: ResourceId, to: ResourceId) -> bool {
        let mut graph: DiGraphMap<ResourceId, ()> = DiGraphMap::new();
        for node in self.nodes.values() {
            graph.add_node(node.id);
            match &node.kind {
                NodeKind::Real { children, .. } => {
                    for child in children.values() {
                        graph.add_edge(node.id, *child, ());
                    }
                }
                NodeKind::Reference { target } => {
                    graph.add_edge(node.id, *target, ());
                }
            }
        }
        graph.contains_node(from)
            && graph.contains_node(to)
            && has_path_connecting(&graph, from, to, None)
    }

    pub fn insert(
        &mut self,
        parent: Option<ResourceId>,
        name: &str,
        type_name: TypeName,
        kind: NodeKind,
    ) -> ResourceId {
        self.next_id += 1;
        let id = ResourceId(self.next_id);
        if let NodeKind::Reference { target } = &kind {
            self.referrers.entry(*target).or_default().insert(id);
        }
        match parent.and_then(|p| self.nodes.get_mut(&p)) {
            Some(Node {
                kind: NodeKind::Real { children, .. },
                ..
            }) => {
                children.insert(name.to_string(), id);
            }
            _ => {
                if parent.is_none() {
                    self.top.insert(name.to_string(), id);
                }
            }
        }
        self.nodes.insert(
            id,
            Node {
                id,
                name: name.to_string(),
                type_name,
                parent,
                kind,
            },
        );
        id
    }

    /// Detaches and drops a single record. Children must have been removed first.
    pub fn remove(&mut self, id: ResourceId) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        if let NodeKind::Reference { target } = &node.kind {
            self.unlink_referrer(*target, id);
        }
        self.referrers.remove(&id);
        match node.parent.and_then(|p| self.nodes.get_mut(&p)) {
            Some(Node {
                kind: NodeKind::Real { children, .. },
                ..
            }) => {
                children.remove(&node.name);
            }
            _ => {
                if node.parent.is_none() {
                    self.top.remove(&node.name);
                }
            }
        }
        Some(node)
    }

    pub fn retarget(&mut self, reference: ResourceId, target: ResourceId, type_name: TypeName) {
        let old = match self.nodes.get_mut(&reference) {
            Some(node) => match &mut node.kind {
                NodeKind::Reference { target: current } => {
                    let old = *current;
                    *current = target;
                    node.type_name = type_name;
                    old
                }
                NodeKind::Real { .. } => return,
            },
            None => return,
        };
        self.unlink_referrer(old, reference);
        self.referrers.entry(target).or_default().insert(reference);
    }

    fn unlink_referrer(&mut self, target: ResourceId, reference: ResourceId) {
        if let Some(set) = self.referrers.get_mut(&target) {
            set.remove(&reference);
            if set.is_empty() {
                self.referrers.remove(&target);
            }
        }
    }

    /// Sets the active flag of a real record. Returns whether it changed.
    pub fn set_active(&mut self, real: ResourceId, flag: bool) -> bool {
        match self.nodes.get_mut(&real).map(|n| &mut n.kind) {
            Some(NodeKind::Real { active, .. }) if *active != flag => {
                *active = flag;
                true
            }
            _ => false,
        }
    }

    /// Stores a value on a real record. Returns whether it differs from the previous one.
    pub fn set_value(&mut self, real: ResourceId, new: ResourceValue) -> bool {
        match self.nodes.get_mut(&real).map(|n| &mut n.kind) {
            Some(NodeKind::Real { value, .. }) => {
                let changed = value.as_ref() != Some(&new);
                *value = Some(new);
                changed
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn real() -> NodeKind {
        NodeKind::Real {
            active: false,
            value: None,
            children: BTreeMap::new(),
        }
    }

    fn path(s: &str) -> ResourcePath {
        s.parse().unwrap()
    }

    #[test]
    fn lookup_distinguishes_virtual_and_unresolved() {
        let mut arena = Arena::default();
        let room = arena.insert(None, "room", TypeName::new("Room"), real());
        let sensor = arena.insert(Some(room), "sensor", TypeName::new("Sensor"), real());
        assert_eq!(
            arena.lookup(&path("room/sensor")),
            Lookup::Found {
                node: sensor,
                real: sensor
            }
        );
        assert_eq!(
            arena.lookup(&path("room/heater")),
            Lookup::Virtual { parent: Some(room) }
        );
        assert_eq!(arena.lookup(&path("room/heater/reading")), Lookup::Unresolved);
        assert_eq!(arena.lookup(&path("hall")), Lookup::Virtual { parent: None });
        assert_eq!(arena.own_path(sensor), path("room/sensor"));
    }

    #[test]
    fn references_resolve_to_their_target() {
        let mut arena = Arena::default();
        let a = arena.insert(None, "a", TypeName::new("Room"), real());
        let reading = arena.insert(Some(a), "reading", TypeName::new("Float"), real());
        let b = arena.insert(None, "b", TypeName::new("Room"), real());
        let alias = arena.insert(
            Some(b),
            "other",
            TypeName::new("Room"),
            NodeKind::Reference { target: a },
        );
        assert_eq!(
            arena.lookup(&path("b/other/reading")),
            Lookup::Found {
                node: reading,
                real: reading
            }
        );
        assert_eq!(arena.location(alias), path("a"));
        assert_eq!(arena.event_targets(a), vec![a, alias]);
        // b reaches a through the reference, not the other way round
        assert!(arena.reaches(b, reading));
        assert!(!arena.reaches(a, b));

        arena.remove(alias);
        assert_eq!(arena.event_targets(a), vec![a]);
        assert_eq!(arena.lookup(&path("b/other")), Lookup::Virtual { parent: Some(b) });
    }

    #[test]
    fn post_order_lists_children_first() {
        let mut arena = Arena::default();
        let root = arena.insert(None, "root", TypeName::new("Resource"), real());
        let mid = arena.insert(Some(root), "mid", TypeName::new("Resource"), real());
        let leaf = arena.insert(Some(mid), "leaf", TypeName::new("Resource"), real());
        assert_eq!(arena.subtree_post_order(root), vec![leaf, mid, root]);
    }
}
