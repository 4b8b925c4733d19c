//! Pattern definitions: a root type plus a table of [Condition]s, validated once by
//! [PatternBuilder::build] and then shared by every demand and instance that uses them.
use petgraph::{algo::toposort, graphmap::DiGraphMap};
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use crate::{
    error::PatternError,
    model::{TypeName, TypeRegistry},
    paths::ResourcePath,
    pattern::instance::PatternView,
    properties::{AccessMode, ResourceValue, ValueKind},
};

/// Name of the implicit root field every pattern has.
pub const MODEL_FIELD: &str = "model";

/// One navigation step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hop {
    /// The child (real or reference) with this name.
    Child(String),
    /// The parent along the path navigated so far.
    Parent,
    /// The canonical location of the resource navigated so far.
    Location,
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hop::Child(name) => write!(f, "{name}"),
            Hop::Parent => write!(f, ".."),
            Hop::Location => write!(f, "@location"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Literal(ResourceValue),
    /// The value of another field of the same instance. If that field does not exist or is
    /// inactive, the constraint holds.
    Field(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub op: CompareOp,
    pub operand: Operand,
}

impl Constraint {
    /// Evaluates `value <op> operand`. Incomparable values never satisfy a constraint.
    pub fn holds_for(&self, value: &ResourceValue, operand: &ResourceValue) -> bool {
        value
            .compare(operand)
            .map(|ordering| self.op.holds(ordering))
            .unwrap_or(false)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequirement {
    pub mode: AccessMode,
    /// When false the mode is requested, but not granting it does not make the field unsatisfied.
    pub required: bool,
}

/// A named slot of a pattern. Built with the chained methods below, e.g.
///
/// ```
/// use resource_patterns::pattern::Condition;
///
/// let reading = Condition::new("reading", "Float")
///     .child("temperatureSensor")
///     .child("reading")
///     .listen_value();
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    pub origin: String,
    pub hops: Vec<Hop>,
    pub type_name: TypeName,
    pub optional: bool,
    pub constraint: Option<Constraint>,
    pub access: Option<AccessRequirement>,
    pub listen_value: bool,
    pub every_update: bool,
}

impl Condition {
    /// A required field of type `type_name`, navigated from the pattern root.
    pub fn new(name: &str, type_name: &str) -> Condition {
        Condition {
            name: name.to_string(),
            origin: MODEL_FIELD.to_string(),
            hops: Vec::new(),
            type_name: TypeName::new(type_name),
            optional: false,
            constraint: None,
            access: None,
            listen_value: false,
            every_update: false,
        }
    }

    /// Navigate from another field instead of the root.
    pub fn from(mut self, origin: &str) -> Condition {
        self.origin = origin.to_string();
        self
    }

    pub fn child(mut self, name: &str) -> Condition {
        self.hops.push(Hop::Child(name.to_string()));
        self
    }

    /// Appends one hop per segment of `relative`; `..` navigates to the parent.
    pub fn path(mut self, relative: &str) -> Condition {
        for segment in relative.split('/').filter(|s| !s.is_empty()) {
            self.hops.push(match segment {
                ".." => Hop::Parent,
                name => Hop::Child(name.to_string()),
            });
        }
        self
    }

    pub fn parent(mut self) -> Condition {
        self.hops.push(Hop::Parent);
        self
    }

    pub fn location(mut self) -> Condition {
        self.hops.push(Hop::Location);
        self
    }

    pub fn optional(mut self) -> Condition {
        self.optional = true;
        self
    }

    pub fn equals<V: Into<ResourceValue>>(self, value: V) -> Condition {
        self.compare(CompareOp::Eq, Operand::Literal(value.into()))
    }

    pub fn compare(mut self, op: CompareOp, operand: Operand) -> Condition {
        self.constraint = Some(Constraint { op, operand });
        self
    }

    /// The field is only satisfied while the consumer holds at least `mode`.
    pub fn requires_access(mut self, mode: AccessMode) -> Condition {
        self.access = Some(AccessRequirement {
            mode,
            required: true,
        });
        self
    }

    /// Requests `mode` for the field without making completeness depend on the grant.
    pub fn requests_access(mut self, mode: AccessMode) -> Condition {
        self.access = Some(AccessRequirement {
            mode,
            required: false,
        });
        self
    }

    /// Re-evaluate the instance when the value of this field changes.
    pub fn listen_value(mut self) -> Condition {
        self.listen_value = true;
        self
    }

    /// Like [Condition::listen_value], but also for writes that do not change the value.
    pub fn every_update(mut self) -> Condition {
        self.listen_value = true;
        self.every_update = true;
        self
    }

    /// Hops rendered relative to the origin field, e.g. `model/temperatureSensor/reading`.
    pub fn navigation(&self) -> String {
        let mut out = self.origin.clone();
        for hop in &self.hops {
            out.push('/');
            out.push_str(&hop.to_string());
        }
        out
    }
}

/// Custom acceptance predicate, evaluated once every required field is satisfied.
///
/// The predicate runs while the graph's read section is held. It must read through the
/// [PatternView] it is given and must not call into the graph.
pub type AcceptFn = Arc<dyn Fn(&PatternView<'_>) -> bool + Send + Sync>;

/// Caller value a demand or query is made with. Acceptance predicates read it through
/// [PatternView::context].
pub type PatternContext = Arc<dyn Any + Send + Sync>;

pub struct PatternBuilder {
    name: String,
    root_type: TypeName,
    conditions: Vec<Condition>,
    accept: Option<AcceptFn>,
}

impl PatternBuilder {
    pub fn condition(mut self, condition: Condition) -> PatternBuilder {
        self.conditions.push(condition);
        self
    }

    pub fn accept<F>(mut self, predicate: F) -> PatternBuilder
    where
        F: Fn(&PatternView<'_>) -> bool + Send + Sync + 'static,
    {
        self.accept = Some(Arc::new(predicate));
        self
    }

    /// Validates the conditions against `types` and fixes the evaluation order.
    pub fn build(self, types: &TypeRegistry) -> Result<Arc<PatternDefinition>, PatternError> {
        let usage = |msg: String| PatternError::Usage(format!("pattern '{}': {msg}", self.name));
        types.require(&self.root_type)?;

        let mut fields = vec![Condition::new(MODEL_FIELD, self.root_type.as_str())];
        let mut index = BTreeMap::from([(MODEL_FIELD.to_string(), 0usize)]);
        for condition in self.conditions {
            if condition.name.is_empty() || condition.name.contains('/') {
                return Err(usage(format!("invalid field name '{}'", condition.name)));
            }
            if condition.name == MODEL_FIELD {
                return Err(usage(format!("'{MODEL_FIELD}' is reserved for the root")));
            }
            if index.contains_key(&condition.name) {
                return Err(usage(format!("duplicate field '{}'", condition.name)));
            }
            if condition.hops.is_empty() {
                return Err(usage(format!("field '{}' has no navigation", condition.name)));
            }
            for hop in &condition.hops {
                if let Hop::Child(name) = hop {
                    ResourcePath::root().child(name).map_err(|_| {
                        usage(format!("field '{}': malformed hop '{name}'", condition.name))
                    })?;
                }
            }
            types.require(&condition.type_name)?;
            index.insert(condition.name.clone(), fields.len());
            fields.push(condition);
        }

        let mut origins = vec![0usize; fields.len()];
        let mut dependencies = DiGraphMap::<usize, ()>::new();
        for (i, field) in fields.iter().enumerate() {
            dependencies.add_node(i);
            if i == 0 {
                continue;
            }
            let origin = *index.get(&field.origin).ok_or_else(|| {
                usage(format!(
                    "field '{}' navigates from unknown field '{}'",
                    field.name, field.origin
                ))
            })?;
            origins[i] = origin;
            dependencies.add_edge(origin, i, ());
        }
        let order = toposort(&dependencies, None).map_err(|cycle| {
            usage(format!(
                "cyclic field dependency involving '{}'",
                fields[cycle.node_id()].name
            ))
        })?;

        let mut dependents = vec![Vec::new(); fields.len()];
        for (i, origin) in origins.iter().enumerate().skip(1) {
            dependents[*origin].push(i);
        }

        // Statically known element types along each navigation.
        let mut declared: Vec<Option<TypeName>> = vec![None; fields.len()];
        declared[0] = Some(self.root_type.clone());
        for &i in order.iter().filter(|&&i| i != 0) {
            let field = &fields[i];
            let mut current = declared[origins[i]].clone();
            for hop in &field.hops {
                current = match hop {
                    Hop::Child(name) => current
                        .as_ref()
                        .and_then(|owner| types.element_type(owner, name).cloned()),
                    Hop::Parent => None,
                    Hop::Location => current,
                };
            }
            if let (Some(element), Some(Hop::Child(_))) = (&current, field.hops.last()) {
                if !types.is_a(element, &field.type_name) && !types.is_a(&field.type_name, element)
                {
                    return Err(PatternError::TypeMismatch {
                        expected: format!("{element} for field '{}'", field.name),
                        found: field.type_name.to_string(),
                    });
                }
            }
            declared[i] = Some(field.type_name.clone());
        }

        for field in fields.iter().skip(1) {
            if let Some(constraint) = &field.constraint {
                let kind = types.value_kind(&field.type_name).ok_or_else(|| {
                    usage(format!(
                        "constraint on field '{}' of type {} which carries no value",
                        field.name, field.type_name
                    ))
                })?;
                match &constraint.operand {
                    Operand::Literal(value) => {
                        if !comparable(kind, value.kind()) {
                            return Err(PatternError::TypeMismatch {
                                expected: format!("{kind} literal for field '{}'", field.name),
                                found: value.kind().to_string(),
                            });
                        }
                    }
                    Operand::Field(other) => {
                        let other_field = index
                            .get(other)
                            .map(|&j| &fields[j])
                            .ok_or_else(|| {
                                usage(format!(
                                    "constraint on '{}' refers to unknown field '{other}'",
                                    field.name
                                ))
                            })?;
                        let other_kind =
                            types.value_kind(&other_field.type_name).ok_or_else(|| {
                                usage(format!(
                                    "constraint on '{}' compares with '{other}' which carries no value",
                                    field.name
                                ))
                            })?;
                        if !comparable(kind, other_kind) {
                            return Err(PatternError::TypeMismatch {
                                expected: format!("{kind} operand for field '{}'", field.name),
                                found: other_kind.to_string(),
                            });
                        }
                    }
                }
            }
            if let Some(access) = &field.access {
                if !access.mode.can_write() {
                    return Err(usage(format!(
                        "field '{}' requests access mode {}, only SHARED and EXCLUSIVE can be requested",
                        field.name, access.mode
                    )));
                }
            }
            if field.listen_value && types.value_kind(&field.type_name).is_none() {
                return Err(usage(format!(
                    "field '{}' listens to values but its type {} carries none",
                    field.name, field.type_name
                )));
            }
        }

        let mut value_watched = vec![false; fields.len()];
        for (i, field) in fields.iter().enumerate() {
            if field.listen_value || field.constraint.is_some() {
                value_watched[i] = true;
            }
            if let Some(Constraint {
                operand: Operand::Field(other),
                ..
            }) = &field.constraint
            {
                if let Some(&j) = index.get(other) {
                    value_watched[j] = true;
                }
            }
        }

        Ok(Arc::new(PatternDefinition {
            name: self.name,
            root_type: self.root_type,
            fields,
            index,
            origins,
            dependents,
            order,
            value_watched,
            accept: self.accept,
        }))
    }
}

fn comparable(a: ValueKind, b: ValueKind) -> bool {
    (a == ValueKind::String) == (b == ValueKind::String)
}

/// A validated pattern. Field 0 is always the root ([MODEL_FIELD]).
pub struct PatternDefinition {
    name: String,
    root_type: TypeName,
    fields: Vec<Condition>,
    index: BTreeMap<String, usize>,
    origins: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
    value_watched: Vec<bool>,
    accept: Option<AcceptFn>,
}

impl fmt::Debug for PatternDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternDefinition")
            .field("name", &self.name)
            .field("root_type", &self.root_type)
            .field("fields", &self.fields)
            .field("accept", &self.accept.is_some())
            .finish()
    }
}

impl PatternDefinition {
    pub fn builder(name: &str, root_type: &str) -> PatternBuilder {
        PatternBuilder {
            name: name.to_string(),
            root_type: TypeName::new(root_type),
            conditions: Vec::new(),
            accept: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_type(&self) -> &TypeName {
        &self.root_type
    }

    /// All fields, the root first, in declaration order.
    pub fn fields(&self) -> &[Condition] {
        &self.fields
    }

    /// The field called `name`, the root included.
    pub fn condition(&self, name: &str) -> Option<&Condition> {
        self.fields().get(self.field_index(name)?)
    }

    /// Indices come from [PatternDefinition::field_index] or the build-time dependency order.
    pub(crate) fn field(&self, index: usize) -> &Condition {
        &self.fields[index]
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub(crate) fn origin(&self, index: usize) -> usize {
        self.origins[index]
    }

    /// Field indices in dependency order: every field comes after the field it navigates from.
    pub(crate) fn order(&self) -> &[usize] {
        &self.order
    }

    pub(crate) fn watches_value(&self, index: usize) -> bool {
        self.value_watched[index]
    }

    pub(crate) fn accept(&self) -> Option<&AcceptFn> {
        self.accept.as_ref()
    }

    /// `field` and every field navigating (transitively) through it, in dependency order.
    pub(crate) fn affected_by(&self, field: usize) -> Vec<usize> {
        let mut found = BTreeSet::from([field]);
        let mut stack = vec![field];
        while let Some(current) = stack.pop() {
            for &dependent in &self.dependents[current] {
                if found.insert(dependent) {
                    stack.push(dependent);
                }
            }
        }
        self.order
            .iter()
            .copied()
            .filter(|i| found.contains(i))
            .collect()
    }

    /// Required fields block completeness while unsatisfied. A required field navigating through
    /// an optional one stays required, so the optional origin then blocks completeness as well.
    pub(crate) fn is_required(&self, field: usize) -> bool {
        !self.fields[field].optional
    }
}
