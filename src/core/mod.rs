//! Core domain models for conflux.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration core: tasks, task outputs, and the dependency DAG.

pub mod dag;
pub mod task;

pub use dag::{CriticalPath, Cycle, DependencyType, TaskDAG};
pub use task::{
    normalize_path, ApiContract, SchemaChange, SchemaOperation, Task, TaskEntry, TaskId,
    TaskOutput, DEFAULT_DURATION,
};
