// Dependency graph validation and run-time resolution

pub mod graph;
pub mod resolver;

pub use graph::{DependencyGraph, DependencyNode};
pub use resolver::{resolve, Blocker, Resolution};
