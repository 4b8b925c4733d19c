//! Read-only diagnostics over pattern demands and instances. Nothing here feeds back into
//! matching.
use serde::{Deserialize, Serialize};

use crate::{
    error::PatternError,
    graph::Lookup,
    model::TypeName,
    paths::ResourcePath,
    pattern::{
        access::{check_pattern, DemandHandle, PatternAccess},
        definition::PatternDefinition,
        instance::{AccessCheck, InstanceCore, InstanceState, PatternInstance},
    },
    properties::{AccessMode, AccessPriority, ConsumerId, DemandId, ResourceValue},
};

/// Decides which resources a caller may inspect.
pub trait AccessPolicy: Send + Sync {
    fn can_read(&self, caller: &ConsumerId, location: &ResourcePath) -> bool;
}

/// Lets every caller read everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn can_read(&self, _caller: &ConsumerId, _location: &ResourcePath) -> bool {
        true
    }
}

/// State of one field of an instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionInfo {
    pub field_name: String,
    pub resource_type: TypeName,
    pub optional: bool,
    pub exists: bool,
    pub active: bool,
    pub is_reference: bool,
    pub path: Option<ResourcePath>,
    pub location: Option<ResourcePath>,
    /// Mode the pattern's consumer currently holds on the field.
    pub access_mode: AccessMode,
    pub value: Option<ResourceValue>,
    pub satisfied: bool,
}

/// Summary of a registered demand.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DemandInfo {
    pub demand: DemandId,
    pub pattern: String,
    pub root_type: TypeName,
    pub consumer: ConsumerId,
    pub priority: AccessPriority,
    /// Root location for individual demands.
    pub individual: Option<ResourcePath>,
    pub complete: Vec<ResourcePath>,
    pub incomplete: Vec<ResourcePath>,
}

impl DemandInfo {
    pub fn to_json(&self) -> Result<String, PatternError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl PatternAccess {
    /// Per-field state of `instance`, leaving out fields `caller` may not read under `policy`.
    /// Satisfaction is evaluated for this pattern access's consumer.
    pub fn get_conditions(
        &self,
        instance: &PatternInstance,
        definition: &PatternDefinition,
        caller: &ConsumerId,
        policy: &dyn AccessPolicy,
    ) -> Result<Vec<ConditionInfo>, PatternError> {
        check_pattern(instance, definition)?;
        let inner = &self.inner;
        let context = instance.demand.and_then(|demand| {
            let matcher = inner.matcher.lock();
            matcher.demands.get(&demand)?.context.clone()
        });
        let view = inner.graph.view();
        let Lookup::Found { real: root, .. } = view.lookup(&instance.root) else {
            return Err(PatternError::NotFound(instance.root.to_string()));
        };
        let root_type = view.type_of(&instance.root);
        if !root_type
            .map(|t| view.types().is_a(&t, definition.root_type()))
            .unwrap_or(false)
        {
            return Err(PatternError::Usage(format!(
                "{} is not a {}",
                instance.root,
                definition.root_type()
            )));
        }
        let mut core = InstanceCore::new(root, definition);
        core.bind_detached(&view, definition);
        core.evaluate(
            &view,
            definition,
            inner.consumer,
            AccessCheck::Granted,
            context.as_ref(),
        );

        let infos = definition
            .fields()
            .iter()
            .zip(&core.fields)
            .filter_map(|(condition, state)| {
                let path = state.binding.path().cloned();
                let location = state
                    .binding
                    .real()
                    .map(|real| view.arena().own_path(real));
                let visible = location.as_ref().or(path.as_ref());
                if let Some(visible) = visible {
                    if !policy.can_read(caller, visible) {
                        tracing::trace!("Hiding field '{}' from {caller}", condition.name);
                        return None;
                    }
                }
                let real = state.binding.real();
                Some(ConditionInfo {
                    field_name: condition.name.clone(),
                    resource_type: condition.type_name.clone(),
                    optional: condition.optional,
                    exists: real.is_some(),
                    active: real.map(|r| view.arena().is_active(r)).unwrap_or(false),
                    is_reference: path
                        .as_ref()
                        .map(|p| view.is_reference(p))
                        .unwrap_or(false),
                    access_mode: real
                        .map(|r| view.access().mode(r, &inner.consumer))
                        .unwrap_or(AccessMode::None),
                    value: real.and_then(|r| view.arena().value(r).cloned()),
                    satisfied: state.satisfied,
                    path,
                    location,
                })
            })
            .collect();
        Ok(infos)
    }

    /// Instances of a demand that are bound but not complete.
    pub fn get_incomplete_patterns(&self, handle: DemandHandle) -> Vec<PatternInstance> {
        self.instances_where(handle, |state| state != InstanceState::Complete)
    }

    /// Instances of a demand that are complete, as last reported to its listener.
    pub fn get_completed_patterns(&self, handle: DemandHandle) -> Vec<PatternInstance> {
        self.instances_where(handle, |state| state == InstanceState::Complete)
    }

    fn instances_where<F>(&self, handle: DemandHandle, keep: F) -> Vec<PatternInstance>
    where
        F: Fn(InstanceState) -> bool,
    {
        let matcher = self.inner.matcher.lock();
        let Some(demand) = matcher.demands.get(&handle.id()) else {
            return Vec::new();
        };
        let view = self.inner.graph.view();
        demand
            .instances
            .values()
            .filter(|instance| keep(instance.state))
            .map(|instance| match &instance.reported {
                Some(reported) => reported.clone(),
                None => instance.snapshot(&view, &demand.definition, Some(handle.id())),
            })
            .collect()
    }

    pub fn registered_demands(&self) -> Vec<DemandInfo> {
        let matcher = self.inner.matcher.lock();
        matcher
            .demands
            .iter()
            .map(|(id, demand)| {
                let (mut complete, mut incomplete) = (Vec::new(), Vec::new());
                for instance in demand.instances.values() {
                    let Some(root) = instance.root_path().cloned() else {
                        continue;
                    };
                    match instance.state {
                        InstanceState::Complete => complete.push(root),
                        _ => incomplete.push(root),
                    }
                }
                DemandInfo {
                    demand: *id,
                    pattern: demand.definition.name().to_string(),
                    root_type: demand.definition.root_type().clone(),
                    consumer: self.inner.consumer,
                    priority: demand.priority,
                    individual: demand.scope.clone(),
                    complete,
                    incomplete,
                }
            })
            .collect()
    }
}
