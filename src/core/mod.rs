//! Core domain models for planwright.
//!
//! This module contains the fundamental data structures of the pipeline:
//! features parsed from the spec, the tasks derived from them, and the
//! dependency graph over those tasks.

pub mod dag;
pub mod feature;
pub mod task;

pub use dag::{link_feature_dependencies, DependencyGraph};
pub use feature::{slugify, Feature, FeatureId, Priority};
pub use task::{Complexity, Domain, Task, TaskId, TaskStatus};
