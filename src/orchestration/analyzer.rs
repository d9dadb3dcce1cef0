//! Dependency analysis for a decomposed task list.
//!
//! [`DependencyAnalyzer`] validates the task list and dependency relation,
//! builds a [`TaskDAG`], and produces the execution schedule: topological
//! order, parallelization levels, critical path, and duration estimates.
//!
//! Malformed input is an [`Error`]. A dependency cycle is not: it is returned
//! as [`Analysis::Cycle`] so the caller can repair the decomposition.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::core::{CriticalPath, Cycle, DependencyType, Task, TaskDAG, TaskEntry, TaskId};
use crate::error::{Error, Result};
use crate::{cxlog, cxlog_debug, cxlog_warn};

/// Exit/error code reported for a dependency cycle.
pub const CYCLE_ERROR_CODE: u8 = 3;

/// Input to [`DependencyAnalyzer::analyze`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub tasks: Vec<TaskEntry>,
    /// Task id to the ids it depends on.
    #[serde(default)]
    pub dependencies: BTreeMap<TaskId, Vec<TaskId>>,
    /// Task id to estimated duration; missing tasks default to 1.0.
    #[serde(default)]
    pub durations: BTreeMap<TaskId, f64>,
}

impl AnalysisRequest {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: tasks.into_iter().map(TaskEntry::Full).collect(),
            ..Default::default()
        }
    }

    /// Declare that `task` depends on `prerequisite`.
    pub fn depends_on(mut self, task: &str, prerequisite: &str) -> Self {
        self.dependencies
            .entry(TaskId::from(task))
            .or_default()
            .push(TaskId::from(prerequisite));
        self
    }

    pub fn duration(mut self, task: &str, duration: f64) -> Self {
        self.durations.insert(TaskId::from(task), duration);
        self
    }
}

/// Schedule computed for an acyclic task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyReport {
    pub topological_order: Vec<TaskId>,
    pub parallelization_levels: Vec<Vec<TaskId>>,
    pub critical_path: CriticalPath,
    pub sequential_duration: f64,
    pub parallel_duration: f64,
    pub speedup: f64,
    pub cycles_detected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleDetails {
    pub cycle: Cycle,
}

/// Structured error object for a cyclic dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleError {
    pub code: u8,
    pub message: String,
    pub details: CycleDetails,
    pub suggestion: String,
}

impl CycleError {
    pub fn new(cycle: Cycle) -> Self {
        Self {
            code: CYCLE_ERROR_CODE,
            message: "Circular dependency detected".to_string(),
            details: CycleDetails { cycle },
            suggestion: "Review task decomposition to break circular dependency".to_string(),
        }
    }
}

/// Outcome of a dependency analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Analysis {
    Report(DependencyReport),
    Cycle { error: CycleError },
}

impl Analysis {
    pub fn cycles_detected(&self) -> bool {
        matches!(self, Analysis::Cycle { .. })
    }

    pub fn report(&self) -> Option<&DependencyReport> {
        match self {
            Analysis::Report(report) => Some(report),
            Analysis::Cycle { .. } => None,
        }
    }

    pub fn cycle(&self) -> Option<&Cycle> {
        match self {
            Analysis::Report(_) => None,
            Analysis::Cycle { error } => Some(&error.details.cycle),
        }
    }
}

/// Stateless analyzer; every call works on its own input snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyAnalyzer;

impl DependencyAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Validate the request and build the dependency graph.
    ///
    /// Durations from the `durations` map override any declared on the task
    /// records themselves.
    ///
    /// # Errors
    /// - duplicate task ids
    /// - dependencies or durations naming unknown tasks
    /// - negative or non-finite durations
    pub fn build_dag(&self, request: &AnalysisRequest) -> Result<TaskDAG> {
        let mut dag = TaskDAG::new();
        let mut known = HashSet::new();

        for entry in &request.tasks {
            let mut task = Task::from(entry.clone());
            if task.id.as_str().trim().is_empty() {
                return Err(Error::Validation("Task with empty id".to_string()));
            }
            if let Some(&d) = request.durations.get(&task.id) {
                task.duration = Some(d);
            }
            if let Some(d) = task.duration {
                if !d.is_finite() || d < 0.0 {
                    return Err(Error::Validation(format!(
                        "Task {} has invalid duration {}",
                        task.id, d
                    )));
                }
            }
            known.insert(task.id.clone());
            dag.add_task(task)?;
        }

        if let Some(unknown) = request.durations.keys().find(|id| !known.contains(*id)) {
            return Err(Error::UnknownTask {
                id: unknown.clone(),
            });
        }

        for (task, prerequisites) in &request.dependencies {
            if !known.contains(task) {
                return Err(Error::UnknownTask { id: task.clone() });
            }
            for prerequisite in prerequisites {
                if !known.contains(prerequisite) {
                    return Err(Error::Validation(format!(
                        "Dependency '{}' not in task list for task '{}'",
                        prerequisite, task
                    )));
                }
                dag.add_dependency(prerequisite, task, DependencyType::DataDependency)?;
            }
        }

        Ok(dag)
    }

    /// Analyze a task list and its dependencies.
    pub fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis> {
        let dag = self.build_dag(request)?;
        cxlog!(
            "Analyzing {} tasks with {} dependencies",
            dag.task_count(),
            dag.dependency_count()
        );
        Ok(Self::analyze_dag(&dag))
    }

    /// Analyze an already-built graph.
    pub fn analyze_dag(dag: &TaskDAG) -> Analysis {
        let topological_order = match dag.topological_order() {
            Ok(order) => order,
            Err(cycle) => {
                cxlog_warn!("Circular dependency detected: {}", cycle);
                return Analysis::Cycle {
                    error: CycleError::new(cycle),
                };
            }
        };

        let (parallelization_levels, critical_path) =
            match (dag.parallel_levels(), dag.critical_path()) {
                (Ok(levels), Ok(cp)) => (levels, cp),
                (Err(cycle), _) | (_, Err(cycle)) => {
                    return Analysis::Cycle {
                        error: CycleError::new(cycle),
                    }
                }
            };

        let duration = |id: &TaskId| {
            dag.get_task(id)
                .map(Task::effective_duration)
                .unwrap_or(0.0)
        };

        let sequential_duration: f64 = topological_order.iter().map(duration).sum();
        let parallel_duration: f64 = parallelization_levels
            .iter()
            .map(|level| level.iter().map(duration).fold(0.0_f64, f64::max))
            .sum();
        let speedup = speedup(sequential_duration, parallel_duration);

        cxlog_debug!(
            "Schedule: {} levels, critical path {} ({}), speedup {}",
            parallelization_levels.len(),
            critical_path.path.len(),
            critical_path.total_duration,
            speedup
        );

        Analysis::Report(DependencyReport {
            topological_order,
            parallelization_levels,
            critical_path,
            sequential_duration,
            parallel_duration,
            speedup,
            cycles_detected: false,
        })
    }
}

/// `sequential / parallel`, rounded to two decimals; 1.0 when nothing runs.
fn speedup(sequential: f64, parallel: f64) -> f64 {
    if parallel > 0.0 {
        let ratio = (sequential / parallel * 100.0).round() / 100.0;
        ratio.max(1.0)
    } else {
        1.0
    }
}
