//! # resource-patterns
//!
//! A typed, hierarchical resource graph for building and device automation, with incremental
//! pattern matching, priority-based access arbitration and causally ordered change notification.
//!
//! ## Overview
//!
//! Resources (rooms, sensors, switches, plain values) form a tree of typed nodes. Subtrees can be
//! aliased through references. Several consumers read, write and react to the graph
//! concurrently. A consumer declares the *shape* of interconnected resources it needs as a
//! pattern; the matcher binds the pattern to every matching root resource and tells the consumer,
//! exactly once per transition, when an instance becomes available or unavailable.
//!
//! ### Key Features
//!
//! - **Incremental matching**: only the navigation of fields touched by an event is re-bound
//! - **Reference aware**: redirecting a reference rebinds atomically, without spurious callbacks
//! - **Access arbitration**: exclusive write access by priority, the incumbent wins ties
//! - **Ordered delivery**: events and callbacks run on one dispatch thread in publish order, off
//!   the mutating call stack, so listeners may mutate the graph themselves
//!
//! ## Architecture
//!
//! - **[`graph`]**: the resource arena (`ResourceGraph`, `Resource`, `GraphView`)
//! - **[`access`]**: the arbitration rules and the per-location request table
//! - **[`dispatch`]**: the notification dispatcher
//! - **[`pattern`]**: pattern definitions, instances, the matcher (`PatternAccess`), change
//!   listeners on single instances and introspection
//! - **[`model`]**: resource types, loaded in code or from TOML
//! - **[`properties`]**, **[`paths`]**, **[`event`]**: shared building blocks
//! - **[`config`]**: engine configuration (TOML)
//!
//! ## Quick Start
//!
//! ```rust
//! use resource_patterns::{
//!     graph::ResourceGraph,
//!     model::TypeRegistry,
//!     properties::ConsumerId,
//! };
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), resource_patterns::PatternError> {
//! let types = TypeRegistry::from_toml_str(
//!     r#"
//! [[types]]
//! name = "TemperatureSensor"
//! [types.elements]
//! reading = "Float"
//! upperLimit = "Float"
//! "#,
//! )?;
//! let graph = ResourceGraph::new(types)?;
//! let app = ConsumerId::new();
//!
//! let sensor = graph.top_level("sensor", "TemperatureSensor")?.create()?;
//! let reading = sensor.sub_resource("reading")?.create()?;
//! graph.add_value_listener(reading.path(), false, |event| println!("{event}"))?;
//!
//! reading.set_value(21.5, app)?;
//! sensor.activate(true)?;
//! graph.wait_idle(Duration::from_secs(1))?;
//! # Ok(())
//! # }
//! ```
//!
//! See [`pattern`] for declaring and demanding patterns.
//!
//! ## Core Concepts
//!
//! ### Real resources and references
//!
//! A real resource is owned by its parent: deleting the parent deletes it. A reference aliases
//! the subtree of a real resource without owning it. Every path resolves to one real resource,
//! its *location*. Activation state, values and access grants live on locations.
//!
//! ### Access modes
//!
//! Each (location, consumer) pair holds at most one request. The highest priority `EXCLUSIVE`
//! request wins and leaves everyone else `READ_ONLY`; without an exclusive holder every consumer
//! holds `SHARED`. Grant changes are events like any other.
//!
//! ### Completeness
//!
//! A pattern instance is complete while every required field exists, is active, meets its
//! value constraint and holds its required access mode, and the optional acceptance predicate
//! agrees. Optional fields never block completeness on their own.

pub mod access;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod graph;
pub mod model;
pub mod paths;
pub mod pattern;
pub mod properties;
#[cfg(test)]
mod tests;

pub use error::*;
