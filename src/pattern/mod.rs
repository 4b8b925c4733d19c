//! Pattern demands: declarative shapes of interconnected resources, matched incrementally
//! against a live [crate::graph::ResourceGraph].
//!
//! # Module Organization
//!
//! - [`definition`]: [PatternDefinition] and its [Condition]s, validated once at build time
//! - [`instance`]: binding of one root resource and the completeness evaluation
//! - [`access`]: [PatternAccess], the demand registry and matcher firing [PatternListener]
//!   callbacks
//! - [`change`]: [PatternChangeListener]s reporting field changes of single instances
//! - [`introspect`]: read-only condition and demand reports
//!
//! # Example
//!
//! ```
//! use resource_patterns::{
//!     graph::ResourceGraph,
//!     model::TypeRegistry,
//!     pattern::{Condition, PatternAccess, PatternDefinition, PatternInstance, PatternListener},
//!     properties::{AccessPriority, ConsumerId},
//! };
//!
//! struct Print;
//!
//! impl PatternListener for Print {
//!     fn available(&self, instance: &PatternInstance) {
//!         println!("{} available", instance.root);
//!     }
//!     fn unavailable(&self, instance: &PatternInstance) {
//!         println!("{} unavailable", instance.root);
//!     }
//! }
//!
//! # fn main() -> Result<(), resource_patterns::PatternError> {
//! let types = TypeRegistry::from_toml_str(
//!     r#"
//! [[types]]
//! name = "Sensor"
//! [types.elements]
//! reading = "Float"
//! "#,
//! )?;
//! let graph = ResourceGraph::new(types)?;
//! let sensors = PatternDefinition::builder("sensor", "Sensor")
//!     .condition(Condition::new("reading", "Float").child("reading"))
//!     .build(&graph.types())?;
//! let access = PatternAccess::new(&graph, ConsumerId::new());
//! access.add_pattern_demand(&sensors, Print, AccessPriority::Lowest)?;
//! # Ok(())
//! # }
//! ```
pub mod access;
pub mod change;
pub mod definition;
pub mod instance;
pub mod introspect;

pub use access::{DemandHandle, PatternAccess, PatternListener};
pub use change::{ChangeHandle, FieldChange, PatternChangeListener};
pub use definition::{
    AccessRequirement, CompareOp, Condition, Constraint, Hop, Operand, PatternBuilder,
    PatternContext, PatternDefinition, MODEL_FIELD,
};
pub use instance::{BoundField, InstanceState, PatternInstance, PatternView};
pub use introspect::{AccessPolicy, AllowAll, ConditionInfo, DemandInfo};
