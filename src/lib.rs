pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;

pub use config::Config;
pub use crate::core::{Task, TaskDAG, TaskId, TaskOutput};
pub use error::{Error, Result};
pub use orchestration::{ConflictDetector, DependencyAnalyzer, MergeCoordinator};
