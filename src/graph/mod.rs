//! Resource graph: the mutable, typed hierarchy of resources the matcher works on.
//!
//! # Module Organization
//!
//! - [`arena`]: records addressed by stable [crate::properties::ResourceId]s. Ownership edges
//!   (parent to child) and reference edges (alias to target) are kept apart.
//! - [`base`]: [ResourceGraph], the mutation entry points and their events
//! - [`view`]: [GraphView], a consistent read snapshot
//! - [`resource`]: [Resource], a path-addressed convenience handle

mod arena;
mod base;
mod resource;
mod view;


pub(crate) use arena::Lookup;
pub use base::ResourceGraph;
pub use resource::Resource;
pub use view::GraphView;
