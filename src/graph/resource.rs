use std::fmt;

use crate::{
    error::PatternError,
    graph::ResourceGraph,
    model::TypeName,
    paths::ResourcePath,
    properties::{AccessMode, AccessPriority, ConsumerId, ResourceId, ResourceValue},
};

/// Path-addressed handle to a resource, real or virtual.
///
/// A virtual handle remembers the type it was declared with (explicitly, or through the declared
/// elements of its parent), so that [Resource::create] knows what to create.
#[derive(Clone)]
pub struct Resource {
    graph: ResourceGraph,
    path: ResourcePath,
    declared: Option<TypeName>,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("path", &self.path)
            .field("declared", &self.declared)
            .finish()
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

impl Resource {
    pub(crate) fn new(
        graph: ResourceGraph,
        path: ResourcePath,
        declared: Option<TypeName>,
    ) -> Resource {
        Resource {
            graph,
            path,
            declared,
        }
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn name(&self) -> &str {
        self.path.name().unwrap_or_default()
    }

    pub fn graph(&self) -> &ResourceGraph {
        &self.graph
    }

    /// The actual type if the resource exists, else the declared one.
    pub fn type_name(&self) -> Option<TypeName> {
        self.graph
            .view()
            .type_of(&self.path)
            .or_else(|| self.declared.clone())
    }

    pub fn exists(&self) -> bool {
        self.graph.exists(&self.path)
    }

    pub fn is_active(&self) -> bool {
        self.graph.is_active(&self.path)
    }

    pub fn is_reference(&self) -> bool {
        self.graph.is_reference(&self.path)
    }

    pub fn location(&self) -> Option<ResourcePath> {
        self.graph.location(&self.path)
    }

    pub fn equals_location(&self, other: &Resource) -> bool {
        self.graph.equals_location(&self.path, &other.path)
    }

    pub fn parent(&self) -> Option<Resource> {
        let parent = self.path.parent().filter(|p| !p.is_root())?;
        Some(Resource::new(self.graph.clone(), parent, None))
    }

    /// Child `name`, typed after the declared element of this resource's type if there is one.
    pub fn sub_resource(&self, name: &str) -> Result<Resource, PatternError> {
        let path = self.path.child(name)?;
        let declared = self.type_name().and_then(|owner| {
            self.graph
                .view()
                .types()
                .element_type(&owner, name)
                .cloned()
        });
        Ok(Resource::new(self.graph.clone(), path, declared))
    }

    /// Child `name` declared with an explicit type.
    pub fn sub_resource_typed(&self, name: &str, type_name: &str) -> Result<Resource, PatternError> {
        Ok(Resource::new(
            self.graph.clone(),
            self.path.child(name)?,
            Some(TypeName::new(type_name)),
        ))
    }

    pub fn sub_resources(&self) -> Vec<Resource> {
        self.graph
            .sub_resources(&self.path)
            .into_iter()
            .map(|path| Resource::new(self.graph.clone(), path, None))
            .collect()
    }

    /// Creates this resource (and missing ancestors). Creating an existing resource is a no-op.
    pub fn create(&self) -> Result<Resource, PatternError> {
        let type_name = self.type_name().ok_or_else(|| {
            PatternError::Usage(format!("{} has no declared type to create", self.path))
        })?;
        self.graph.create(&self.path, &type_name)?;
        Ok(self.clone())
    }

    pub fn add_decorator(&self, name: &str, type_name: &str) -> Result<Resource, PatternError> {
        let type_name = TypeName::new(type_name);
        self.graph.add_decorator(&self.path, name, &type_name)?;
        Ok(Resource::new(
            self.graph.clone(),
            self.path.child(name)?,
            Some(type_name),
        ))
    }

    pub fn delete(&self) -> Result<bool, PatternError> {
        self.graph.delete(&self.path)
    }

    pub fn activate(&self, recursive: bool) -> Result<(), PatternError> {
        self.graph.activate(&self.path, recursive)
    }

    pub fn deactivate(&self, recursive: bool) -> Result<(), PatternError> {
        self.graph.deactivate(&self.path, recursive)
    }

    pub fn set_as_reference(&self, target: &Resource) -> Result<ResourceId, PatternError> {
        self.graph.set_as_reference(&self.path, &target.path)
    }

    pub fn value(&self) -> Option<ResourceValue> {
        self.graph.value(&self.path)
    }

    pub fn set_value<V: Into<ResourceValue>>(
        &self,
        value: V,
        consumer: ConsumerId,
    ) -> Result<bool, PatternError> {
        self.graph.set_value(&self.path, value, consumer)
    }

    pub fn request_access_mode(
        &self,
        consumer: ConsumerId,
        mode: AccessMode,
        priority: AccessPriority,
    ) -> Result<bool, PatternError> {
        self.graph
            .request_access(&self.path, consumer, mode, priority)
    }

    pub fn access_mode(&self, consumer: &ConsumerId) -> AccessMode {
        self.graph.access_mode(&self.path, consumer)
    }

    pub fn access_priority(&self, consumer: &ConsumerId) -> Option<AccessPriority> {
        self.graph.access_priority(&self.path, consumer)
    }
}
