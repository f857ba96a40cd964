//! Task scheduling: a bounded worker pool and dependency-ordered phases.

mod graph;
mod pool;

pub use graph::{DependencyGraph, PhaseReport, TaskOutcome};
pub use pool::{UNBOUNDED, run_tasks};
