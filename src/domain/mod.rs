//! Internal domain types: stored task records and the dependency graph.

pub mod graph;
pub mod record;

pub use graph::DependencyGraph;
pub use record::{Lease, TaskRecord};
