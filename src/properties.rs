//! [crate::properties] contains the basic building blocks shared by the resource graph, the access
//! arbitrator and the pattern matcher: identifiers, access modes and priorities, and resource
//! values.
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    fmt::{Display, Formatter},
    sync::atomic::{AtomicU64, Ordering as AtomicOrdering},
};

pub use uuid::Uuid;

use crate::error::PatternError;

/// Stable arena id of a resource record (real resource or reference). Ids are never reused within a
/// graph.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

impl Display for ResourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque, stable identity of a consumer (an application using the graph).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConsumerId(pub Uuid);

impl ConsumerId {
    pub fn new() -> ConsumerId {
        ConsumerId(Uuid::new_v4())
    }

    pub fn nil() -> ConsumerId {
        ConsumerId(Uuid::nil())
    }
}

impl Default for ConsumerId {
    fn default() -> Self {
        ConsumerId::new()
    }
}

impl Display for ConsumerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Handle of a listener registration with the [crate::dispatch::Dispatcher].
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// Handle of a registered pattern demand.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct DemandId(pub u64);

impl Display for DemandId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "demand-{}", self.0)
    }
}

/// Monotonic id source shared by the id newtypes above.
#[derive(Debug, Default)]
pub(crate) struct IdSource(AtomicU64);

impl IdSource {
    pub(crate) fn next(&self) -> u64 {
        self.0.fetch_add(1, AtomicOrdering::Relaxed) + 1
    }
}

/// Effective write access a consumer holds on a resource. Ordered from weakest to strongest.
#[derive(
    Clone, Copy, Debug, Default, Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    None,
    #[default]
    ReadOnly,
    Shared,
    Exclusive,
}

impl AccessMode {
    /// True if holding `self` satisfies a requirement of `required`.
    pub fn satisfies(&self, required: AccessMode) -> bool {
        *self >= required
    }

    pub fn can_write(&self) -> bool {
        matches!(self, AccessMode::Shared | AccessMode::Exclusive)
    }
}

impl Display for AccessMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AccessMode::None => "NONE",
            AccessMode::ReadOnly => "READ_ONLY",
            AccessMode::Shared => "SHARED",
            AccessMode::Exclusive => "EXCLUSIVE",
        };
        write!(f, "{s}")
    }
}

/// Fixed total order used to arbitrate competing access requests.
#[derive(
    Clone, Copy, Debug, Default, Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum AccessPriority {
    #[default]
    Lowest,
    GenericManagement,
    DeviceGroupManagement,
    DeviceSpecific,
    GridStabilisation,
    Highest,
}

impl Display for AccessPriority {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The kind of value a resource type carries, if any.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueKind {
    Float,
    Integer,
    Boolean,
    String,
    Time,
}

impl Display for ValueKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ResourceValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Time(TimeValue),
}

/// Milliseconds since the unix epoch.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeValue {
    pub millis: i64,
}

impl ResourceValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            ResourceValue::Boolean(_) => ValueKind::Boolean,
            ResourceValue::Integer(_) => ValueKind::Integer,
            ResourceValue::Float(_) => ValueKind::Float,
            ResourceValue::String(_) => ValueKind::String,
            ResourceValue::Time(_) => ValueKind::Time,
        }
    }

    /// The value a freshly created resource of `kind` holds.
    pub fn default_for(kind: ValueKind) -> ResourceValue {
        match kind {
            ValueKind::Boolean => ResourceValue::Boolean(false),
            ValueKind::Integer => ResourceValue::Integer(0),
            ValueKind::Float => ResourceValue::Float(0.0),
            ValueKind::String => ResourceValue::String(String::new()),
            ValueKind::Time => ResourceValue::Time(TimeValue { millis: 0 }),
        }
    }

    /// Numeric view used for mixed comparisons. Booleans map to 0/1.
    fn as_f64(&self) -> Option<f64> {
        match self {
            ResourceValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            ResourceValue::Integer(i) => Some(*i as f64),
            ResourceValue::Float(x) => Some(*x),
            ResourceValue::Time(t) => Some(t.millis as f64),
            ResourceValue::String(_) => None,
        }
    }

    /// Orders two values. Strings only compare with strings; everything else compares numerically.
    /// Returns None for incomparable pairs (including NaN).
    pub fn compare(&self, other: &ResourceValue) -> Option<Ordering> {
        match (self, other) {
            (ResourceValue::String(l), ResourceValue::String(r)) => Some(l.cmp(r)),
            (ResourceValue::Integer(l), ResourceValue::Integer(r)) => Some(l.cmp(r)),
            (ResourceValue::Time(l), ResourceValue::Time(r)) => Some(l.cmp(r)),
            (l, r) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        }
    }
}

impl Display for ResourceValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceValue::Boolean(b) => write!(f, "{b}"),
            ResourceValue::Integer(i) => write!(f, "{i}"),
            ResourceValue::Float(x) => write!(f, "{x}"),
            ResourceValue::String(s) => write!(f, "\"{s}\""),
            ResourceValue::Time(t) => write!(f, "{}ms", t.millis),
        }
    }
}

impl From<bool> for ResourceValue {
    fn from(b: bool) -> Self {
        ResourceValue::Boolean(b)
    }
}

impl From<i64> for ResourceValue {
    fn from(i: i64) -> Self {
        ResourceValue::Integer(i)
    }
}

impl From<f64> for ResourceValue {
    fn from(x: f64) -> Self {
        ResourceValue::Float(x)
    }
}

impl From<&str> for ResourceValue {
    fn from(s: &str) -> Self {
        ResourceValue::String(s.to_string())
    }
}

impl From<String> for ResourceValue {
    fn from(s: String) -> Self {
        ResourceValue::String(s)
    }
}

impl TryFrom<&ResourceValue> for f64 {
    type Error = PatternError;

    fn try_from(value: &ResourceValue) -> Result<Self, Self::Error> {
        value.as_f64().ok_or_else(|| PatternError::TypeMismatch {
            expected: "numeric value".to_string(),
            found: value.kind().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_modes_are_ordered_by_strength() {
        assert!(AccessMode::Exclusive.satisfies(AccessMode::Shared));
        assert!(AccessMode::Shared.satisfies(AccessMode::Shared));
        assert!(!AccessMode::Shared.satisfies(AccessMode::Exclusive));
        assert!(!AccessMode::ReadOnly.can_write());
    }

    #[test]
    fn priorities_form_a_total_order() {
        assert!(AccessPriority::Lowest < AccessPriority::GenericManagement);
        assert!(AccessPriority::DeviceSpecific < AccessPriority::Highest);
        let parsed: AccessPriority = serde_json::from_str("\"device_specific\"").unwrap();
        assert_eq!(parsed, AccessPriority::DeviceSpecific);
    }

    #[test]
    fn mixed_numeric_values_compare() {
        let reading = ResourceValue::Float(21.0);
        let limit = ResourceValue::Integer(25);
        assert_eq!(reading.compare(&limit), Some(Ordering::Less));
        assert_eq!(
            ResourceValue::from("a").compare(&ResourceValue::Float(1.0)),
            None
        );
        assert_eq!(ResourceValue::Float(f64::NAN).compare(&limit), None);
    }
}
