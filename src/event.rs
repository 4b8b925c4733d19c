use enumset::{EnumSet, EnumSetType};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::{
    paths::ResourcePath,
    properties::{AccessMode, ConsumerId, ResourceId, ResourceValue},
};

/// Structural change kinds reported by [ResourceEvent::Structure].
#[derive(Debug, Serialize, Deserialize, PartialOrd, Ord, Hash, EnumSetType)]
#[enumset(repr = "u16")]
pub enum StructureEventKind {
    Created,
    Deleted,
    Activated,
    Deactivated,
    /// A reference was installed or redirected. Reported on the reference resource itself.
    ReferenceAdded,
    ReferenceRemoved,
    /// Reported on the parent when a child (real or reference) appears.
    SubresourceAdded,
    SubresourceRemoved,
}

impl Display for StructureEventKind {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let s = match self {
            StructureEventKind::Created => "CREATED",
            StructureEventKind::Deleted => "DELETED",
            StructureEventKind::Activated => "ACTIVATED",
            StructureEventKind::Deactivated => "DEACTIVATED",
            StructureEventKind::ReferenceAdded => "REFERENCE_ADDED",
            StructureEventKind::ReferenceRemoved => "REFERENCE_REMOVED",
            StructureEventKind::SubresourceAdded => "SUBRESOURCE_ADDED",
            StructureEventKind::SubresourceRemoved => "SUBRESOURCE_REMOVED",
        };
        write!(f, "{s}")
    }
}

/// The listener family an event belongs to.
#[derive(Debug, Serialize, Deserialize, PartialOrd, Ord, Hash, EnumSetType)]
#[enumset(repr = "u8")]
pub enum EventKind {
    Structure,
    Value,
    AccessMode,
}

/// A change of the resource graph, published through the [crate::dispatch::Dispatcher].
///
/// `resource` always names the arena record the change happened to. `path` is the path the record
/// had when the event was published; deleted resources keep reporting their last path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResourceEvent {
    Structure {
        kind: StructureEventKind,
        resource: ResourceId,
        path: ResourcePath,
        /// The child concerned by a `SubresourceAdded`/`SubresourceRemoved` event, or the new target
        /// of a `ReferenceAdded` event.
        related: Option<ResourceId>,
    },
    Value {
        resource: ResourceId,
        path: ResourcePath,
        value: ResourceValue,
        /// False if the write stored the value the resource already held.
        changed: bool,
    },
    AccessModeChanged {
        resource: ResourceId,
        path: ResourcePath,
        consumer: ConsumerId,
        mode: AccessMode,
    },
}

impl ResourceEvent {
    pub fn resource(&self) -> ResourceId {
        match self {
            ResourceEvent::Structure { resource, .. } => *resource,
            ResourceEvent::Value { resource, .. } => *resource,
            ResourceEvent::AccessModeChanged { resource, .. } => *resource,
        }
    }

    pub fn path(&self) -> &ResourcePath {
        match self {
            ResourceEvent::Structure { path, .. } => path,
            ResourceEvent::Value { path, .. } => path,
            ResourceEvent::AccessModeChanged { path, .. } => path,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            ResourceEvent::Structure { .. } => EventKind::Structure,
            ResourceEvent::Value { .. } => EventKind::Value,
            ResourceEvent::AccessModeChanged { .. } => EventKind::AccessMode,
        }
    }

    pub fn structure_kind(&self) -> Option<StructureEventKind> {
        match self {
            ResourceEvent::Structure { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// True if this is a structure event of one of `kinds`.
    pub fn is_structure_in(&self, kinds: EnumSet<StructureEventKind>) -> bool {
        self.structure_kind()
            .map(|kind| kinds.contains(kind))
            .unwrap_or(false)
    }
}

impl Display for ResourceEvent {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            ResourceEvent::Structure {
                kind,
                resource,
                path,
                ..
            } => write!(f, "{kind} {path} ({resource})"),
            ResourceEvent::Value {
                resource,
                path,
                value,
                changed,
            } => {
                let note = if *changed { "" } else { " (unchanged)" };
                write!(f, "VALUE {path} ({resource}) = {value}{note}")
            }
            ResourceEvent::AccessModeChanged {
                resource,
                path,
                consumer,
                mode,
            } => write!(f, "ACCESS {path} ({resource}) {consumer} -> {mode}"),
        }
    }
}
