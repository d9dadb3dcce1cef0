//! Merge coordination for a batch of completed task outputs.
//!
//! A merge runs in two phases. [`MergeCoordinator::plan`] is pure: it
//! validates the batch, resolves conflicts according to the
//! [`ResolutionPolicy`], and computes the merge order on an effective graph
//! where file conflicts between otherwise unordered tasks become ordering
//! edges. [`MergeCoordinator::merge`] then stages the batch, runs the
//! verification command and rolls back on failure.
//!
//! Dry runs go through the identical planning phase and stop before the
//! first write.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::core::{
    normalize_path, Cycle, DependencyType, SchemaChange, Task, TaskDAG, TaskId, TaskOutput,
};
use crate::error::{Error, Result};
use crate::{cxlog, cxlog_debug, cxlog_error, cxlog_warn};

use super::detector::{
    Conflict, ConflictDetails, ConflictDetector, ConflictKind, ConflictReport, DetectorOptions,
    Severity,
};
use super::staging::{StagingArea, StagingTransaction};
use super::verify::{VerificationOutcome, Verifier};

/// Staging-relative path of the accumulated schema changes of a batch.
pub const SCHEMA_CHANGES_FILE: &str = ".conflux/schema_changes.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Dependency order with conflict-aware serialization edges.
    #[default]
    Topological,
    /// Task id order; dependencies and conflicts do not reorder.
    Sequential,
}

impl FromStr for MergeStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "topological" => Ok(MergeStrategy::Topological),
            "sequential" => Ok(MergeStrategy::Sequential),
            other => Err(Error::Validation(format!("Unknown merge strategy '{}'", other))),
        }
    }
}

/// What to do with auto-resolvable conflicts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// Order the conflicting tasks and merge them all.
    #[default]
    Serialize,
    /// Leave conflicting tasks out of the batch.
    Skip,
    /// Refuse to merge while any conflict is present.
    Manual,
}

impl FromStr for ResolutionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "serialize" => Ok(ResolutionPolicy::Serialize),
            "skip" => Ok(ResolutionPolicy::Skip),
            "manual" => Ok(ResolutionPolicy::Manual),
            other => Err(Error::Validation(format!(
                "Unknown resolution policy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Success,
    Failed,
    DryRun,
}

/// How one conflict was handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub conflict_type: ConflictKind,
    pub tasks: Vec<TaskId>,
    pub strategy: ResolutionPolicy,
    pub action: String,
}

fn default_true() -> bool {
    true
}

/// Input to [`MergeCoordinator::merge`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeRequest {
    pub outputs: BTreeMap<TaskId, TaskOutput>,
    /// Task id to the ids it depends on.
    #[serde(default)]
    pub dependencies: BTreeMap<TaskId, Vec<TaskId>>,
    /// Precomputed conflict report; detected from `outputs` when absent.
    #[serde(default)]
    pub conflicts: Option<ConflictReport>,
    #[serde(default)]
    pub strategy: MergeStrategy,
    #[serde(default)]
    pub resolution: ResolutionPolicy,
    #[serde(default)]
    pub verify: Option<String>,
    #[serde(default)]
    pub verify_timeout_secs: Option<u64>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,
}

impl MergeRequest {
    pub fn new(outputs: BTreeMap<TaskId, TaskOutput>) -> Self {
        Self {
            outputs,
            rollback_on_failure: true,
            ..Default::default()
        }
    }

    pub fn depends_on(mut self, task: &str, prerequisite: &str) -> Self {
        self.dependencies
            .entry(TaskId::from(task))
            .or_default()
            .push(TaskId::from(prerequisite));
        self
    }

    pub fn with_conflicts(mut self, report: ConflictReport) -> Self {
        self.conflicts = Some(report);
        self
    }

    pub fn with_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_resolution(mut self, resolution: ResolutionPolicy) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn verify(mut self, command: &str) -> Self {
        self.verify = Some(command.to_string());
        self
    }

    pub fn verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn rollback_on_failure(mut self, rollback: bool) -> Self {
        self.rollback_on_failure = rollback;
        self
    }
}

/// Terminal artifact of one merge.
///
/// Holds no timestamps or durations, so retrying identical input against an
/// unchanged staging area yields an identical result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub status: MergeStatus,
    pub merge_order: Vec<TaskId>,
    /// Tasks whose changes were (or, in a dry run, would be) applied.
    pub merged_tasks: Vec<TaskId>,
    pub skipped_tasks: Vec<TaskId>,
    pub conflicts_resolved: usize,
    pub resolutions: Vec<Resolution>,
    pub verification: VerificationOutcome,
    pub merged_files: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub rollbacks: u32,
}

impl MergeResult {
    fn empty(status: MergeStatus) -> Self {
        Self {
            status,
            merge_order: Vec::new(),
            merged_tasks: Vec::new(),
            skipped_tasks: Vec::new(),
            conflicts_resolved: 0,
            resolutions: Vec::new(),
            verification: VerificationOutcome::default(),
            merged_files: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            rollbacks: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == MergeStatus::Success
    }

    pub fn is_failed(&self) -> bool {
        self.status == MergeStatus::Failed
    }
}

/// A single staged write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedWrite {
    pub task: TaskId,
    pub path: String,
    pub content: Vec<u8>,
}

/// Outcome of the planning phase.
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub merge_order: Vec<TaskId>,
    pub skipped_tasks: Vec<TaskId>,
    pub resolutions: Vec<Resolution>,
    pub report: ConflictReport,
    /// Writes in application order, schema bookkeeping last.
    pub writes: Vec<PlannedWrite>,
    pub warnings: Vec<String>,
    /// Reasons the batch must not be applied.
    pub blockers: Vec<String>,
    /// Dependency cycle in the effective graph, if any.
    pub cycle: Option<Cycle>,
}

impl MergePlan {
    pub fn conflicts_resolved(&self) -> usize {
        self.resolutions
            .iter()
            .filter(|r| r.strategy != ResolutionPolicy::Manual)
            .count()
    }

    /// Sorted, de-duplicated staging paths the plan writes.
    pub fn merged_files(&self) -> Vec<String> {
        self.writes
            .iter()
            .map(|w| w.path.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[derive(Serialize)]
struct StagedSchemaChange<'a> {
    task: &'a TaskId,
    #[serde(flatten)]
    change: &'a SchemaChange,
}

/// Applies merge batches to one exclusively owned staging area.
#[derive(Debug)]
pub struct MergeCoordinator {
    staging: StagingArea,
    detector: ConflictDetector,
    verify_timeout: Duration,
}

impl MergeCoordinator {
    pub fn new(staging: StagingArea) -> Self {
        Self {
            staging,
            detector: ConflictDetector::new(),
            verify_timeout: Duration::from_secs(crate::config::DEFAULT_VERIFY_TIMEOUT_SECS),
        }
    }

    /// Build a coordinator from the user configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let detector = ConflictDetector::with_options(DetectorOptions {
            only: None,
            fine_grained_patching: config.fine_grained_patching,
        });
        Ok(Self::new(StagingArea::new(config.staging_dir()?))
            .with_detector(detector)
            .with_verify_timeout(config.verify_timeout()))
    }

    pub fn with_detector(mut self, detector: ConflictDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Compute everything about the merge without touching the staging area.
    pub fn plan(&self, request: &MergeRequest) -> Result<MergePlan> {
        for (task, output) in &request.outputs {
            output.validate(task)?;
        }
        for (task, prerequisites) in &request.dependencies {
            if !request.outputs.contains_key(task) {
                return Err(Error::UnknownTask { id: task.clone() });
            }
            if let Some(unknown) = prerequisites
                .iter()
                .find(|p| !request.outputs.contains_key(*p))
            {
                return Err(Error::Validation(format!(
                    "Dependency '{}' not in task outputs for task '{}'",
                    unknown, task
                )));
            }
        }

        let report = match &request.conflicts {
            Some(report) => report.clone(),
            None => self.detector.detect(&request.outputs)?,
        };

        let mut warnings = Vec::new();
        let mut blockers = Vec::new();
        let mut resolutions = Vec::new();
        let mut skipped = BTreeSet::new();

        for conflict in &report.conflicts {
            if let Some(unknown) = conflict
                .tasks
                .iter()
                .find(|t| !request.outputs.contains_key(*t))
            {
                warnings.push(format!(
                    "Ignoring {} on unknown task {}",
                    conflict.kind, unknown
                ));
                continue;
            }

            if is_blocking(conflict) {
                let message = format!(
                    "Unresolvable {} {} between {} requires manual intervention",
                    conflict.severity,
                    conflict.kind,
                    join_ids(&conflict.tasks, ", ")
                );
                cxlog_warn!("{}", message);
                blockers.push(message);
                resolutions.push(escalation(conflict));
                continue;
            }

            match request.resolution {
                ResolutionPolicy::Serialize => {
                    let order = conflict.serialize_order().unwrap_or(&conflict.tasks);
                    resolutions.push(Resolution {
                        conflict_type: conflict.kind,
                        tasks: conflict.tasks.clone(),
                        strategy: ResolutionPolicy::Serialize,
                        action: format!("Execute tasks in order: {}", join_ids(order, " -> ")),
                    });
                }
                ResolutionPolicy::Skip => {
                    skipped.extend(conflict.tasks.iter().cloned());
                    resolutions.push(Resolution {
                        conflict_type: conflict.kind,
                        tasks: conflict.tasks.clone(),
                        strategy: ResolutionPolicy::Skip,
                        action: "Skipped - manual resolution required".to_string(),
                    });
                }
                ResolutionPolicy::Manual => {
                    blockers.push(format!(
                        "{} between {} awaits manual resolution",
                        conflict.kind,
                        join_ids(&conflict.tasks, ", ")
                    ));
                    resolutions.push(escalation(conflict));
                }
            }
        }

        propagate_skips(&request.dependencies, &mut skipped, &mut warnings);

        let included: Vec<&TaskId> = request
            .outputs
            .keys()
            .filter(|t| !skipped.contains(*t))
            .collect();

        let ordered = match request.strategy {
            MergeStrategy::Topological => {
                let dag = effective_dag(&included, request, &report)?;
                dag.topological_order()
            }
            MergeStrategy::Sequential => {
                let order: Vec<TaskId> = included.iter().map(|t| (*t).clone()).collect();
                warn_out_of_order(&order, &request.dependencies, &mut warnings);
                Ok(order)
            }
        };

        let (merge_order, cycle) = match ordered {
            Ok(order) => (order, None),
            Err(cycle) => (Vec::new(), Some(cycle)),
        };

        let writes = planned_writes(&merge_order, &request.outputs, &mut warnings)?;

        Ok(MergePlan {
            merge_order,
            skipped_tasks: skipped.into_iter().collect(),
            resolutions,
            report,
            writes,
            warnings,
            blockers,
            cycle,
        })
    }

    /// Plan, stage, verify and, on failure, roll back one batch.
    ///
    /// Returns `Err` only for malformed input. Cycles, blocking conflicts,
    /// staging failures and verification failures are reported through a
    /// `failed` [`MergeResult`].
    pub async fn merge(&mut self, request: &MergeRequest) -> Result<MergeResult> {
        let started = Instant::now();
        cxlog!(
            "Merging {} task outputs (strategy={:?}, resolution={:?}, dry_run={})",
            request.outputs.len(),
            request.strategy,
            request.resolution,
            request.dry_run
        );

        let plan = self.plan(request)?;
        let mut result = MergeResult::empty(MergeStatus::Failed);
        result.skipped_tasks = plan.skipped_tasks.clone();
        result.conflicts_resolved = plan.conflicts_resolved();
        result.resolutions = plan.resolutions.clone();
        result.warnings = plan.warnings.clone();

        if let Some(cycle) = &plan.cycle {
            cxlog_error!("Circular dependency detected: {}", cycle);
            result
                .errors
                .push(format!("Circular dependency detected: {}", cycle));
            return Ok(result);
        }

        result.merge_order = plan.merge_order.clone();
        result.merged_files = plan.merged_files();

        if request.dry_run {
            result.status = MergeStatus::DryRun;
            result.merged_tasks = plan.merge_order.clone();
            result.warnings.extend(plan.blockers.iter().cloned());
            result.verification = match &request.verify {
                Some(command) => VerificationOutcome::skipped(&format!(
                    "Verification skipped (dry run): {}",
                    command
                )),
                None => VerificationOutcome::default(),
            };
            cxlog!(
                "Dry run planned {} tasks in {:?}",
                result.merge_order.len(),
                started.elapsed()
            );
            return Ok(result);
        }

        if !plan.blockers.is_empty() {
            result.errors.extend(plan.blockers.iter().cloned());
            result.merged_files.clear();
            cxlog_warn!("Merge blocked by {} unresolved conflicts", plan.blockers.len());
            return Ok(result);
        }

        let timeout = request
            .verify_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.verify_timeout);

        let mut tx = self.staging.begin();
        if let Err(e) = tx.ensure_root() {
            let message = format!("Failed to create staging area {}: {}", tx.root().display(), e);
            cxlog_error!("{}", message);
            result.errors.push(message);
            roll_back(tx, &mut result);
            return Ok(result);
        }
        result.merged_tasks = plan.merge_order.clone();

        if let Err((write, e)) = apply(&mut tx, &plan.writes) {
            let message = format!("Failed to stage {} from {}: {}", write.path, write.task, e);
            cxlog_error!("{}", message);
            result.errors.push(message);
            roll_back(tx, &mut result);
            return Ok(result);
        }

        if let Some(command) = &request.verify {
            let verifier = Verifier::new(command.as_str()).with_timeout(timeout);
            result.verification = verifier.run(tx.root()).await;

            if result.verification.failed() {
                result.errors.push(if result.verification.timed_out {
                    format!(
                        "Verification timed out after {}s",
                        verifier.timeout().as_secs_f64()
                    )
                } else {
                    "Verification failed".to_string()
                });
                cxlog_debug!("Failed verification command: {}", verifier.command());
                if request.rollback_on_failure {
                    roll_back(tx, &mut result);
                } else {
                    tx.commit();
                    result
                        .warnings
                        .push("Rollback disabled; staged changes left in place".to_string());
                }
                cxlog_warn!("Merge failed verification after {:?}", started.elapsed());
                return Ok(result);
            }
        }

        tx.commit();
        result.status = MergeStatus::Success;
        cxlog!(
            "Merged {} tasks ({} files) in {:?}",
            result.merged_tasks.len(),
            result.merged_files.len(),
            started.elapsed()
        );
        Ok(result)
    }
}

fn is_blocking(conflict: &Conflict) -> bool {
    !conflict.auto_resolvable || conflict.severity == Severity::Critical
}

fn escalation(conflict: &Conflict) -> Resolution {
    Resolution {
        conflict_type: conflict.kind,
        tasks: conflict.tasks.clone(),
        strategy: ResolutionPolicy::Manual,
        action: "Escalated - requires user decision".to_string(),
    }
}

fn join_ids(ids: &[TaskId], sep: &str) -> String {
    ids.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(sep)
}

/// Skip every task that depends, directly or not, on a skipped task.
fn propagate_skips(
    dependencies: &BTreeMap<TaskId, Vec<TaskId>>,
    skipped: &mut BTreeSet<TaskId>,
    warnings: &mut Vec<String>,
) {
    loop {
        let newly: Vec<(TaskId, TaskId)> = dependencies
            .iter()
            .filter(|(task, _)| !skipped.contains(*task))
            .filter_map(|(task, prereqs)| {
                prereqs
                    .iter()
                    .find(|p| skipped.contains(*p))
                    .map(|p| (task.clone(), p.clone()))
            })
            .collect();
        if newly.is_empty() {
            return;
        }
        for (task, prerequisite) in newly {
            warnings.push(format!(
                "Task {} skipped: depends on skipped task {}",
                task, prerequisite
            ));
            skipped.insert(task);
        }
    }
}

/// Dependency graph over the included tasks plus conflict serialization edges.
fn effective_dag(
    included: &[&TaskId],
    request: &MergeRequest,
    report: &ConflictReport,
) -> Result<TaskDAG> {
    let mut dag = TaskDAG::new();
    for task in included {
        dag.add_task(Task::new(task.as_str(), ""))?;
    }

    for (task, prerequisites) in &request.dependencies {
        if !dag.contains_task(task) {
            continue;
        }
        for prerequisite in prerequisites {
            if dag.contains_task(prerequisite) {
                dag.add_dependency(prerequisite, task, DependencyType::DataDependency)?;
            }
        }
    }

    for conflict in &report.conflicts {
        if conflict.kind != ConflictKind::File || is_blocking(conflict) {
            continue;
        }
        let order = serialization_order(conflict, &request.outputs);
        let file = match &conflict.details {
            ConflictDetails::File { file, .. } => vec![file.clone()],
            _ => Vec::new(),
        };
        for (i, earlier) in order.iter().enumerate() {
            for later in &order[i + 1..] {
                if !dag.contains_task(earlier) || !dag.contains_task(later) {
                    continue;
                }
                if dag.add_serialization_edge(earlier, later, file.clone())? {
                    cxlog_debug!("Serialized {} before {} ({:?})", earlier, later, file);
                }
            }
        }
    }

    Ok(dag)
}

/// The report's order, or ascending priority then id when it carries none.
fn serialization_order(conflict: &Conflict, outputs: &BTreeMap<TaskId, TaskOutput>) -> Vec<TaskId> {
    if let Some(order) = conflict.serialize_order() {
        return order.to_vec();
    }
    let mut order = conflict.tasks.clone();
    order.sort_by(|a, b| {
        let pa = outputs.get(a).map_or(0, |o| o.priority);
        let pb = outputs.get(b).map_or(0, |o| o.priority);
        pa.cmp(&pb).then_with(|| a.cmp(b))
    });
    order
}

fn warn_out_of_order(
    order: &[TaskId],
    dependencies: &BTreeMap<TaskId, Vec<TaskId>>,
    warnings: &mut Vec<String>,
) {
    let position: BTreeMap<&TaskId, usize> = order.iter().enumerate().map(|(i, t)| (t, i)).collect();
    for (task, prerequisites) in dependencies {
        for prerequisite in prerequisites {
            if let (Some(t), Some(p)) = (position.get(task), position.get(prerequisite)) {
                if p > t {
                    warnings.push(format!(
                        "Sequential order merges {} before its dependency {}",
                        task, prerequisite
                    ));
                }
            }
        }
    }
}

fn planned_writes(
    merge_order: &[TaskId],
    outputs: &BTreeMap<TaskId, TaskOutput>,
    warnings: &mut Vec<String>,
) -> Result<Vec<PlannedWrite>> {
    let mut writes: Vec<PlannedWrite> = Vec::new();
    let mut writer: BTreeMap<String, &TaskId> = BTreeMap::new();
    let mut schema: Vec<StagedSchemaChange<'_>> = Vec::new();

    for task in merge_order {
        let Some(output) = outputs.get(task) else {
            continue;
        };
        for (path, content) in &output.files {
            let path = normalize_path(path);
            match writer.insert(path.clone(), task) {
                Some(previous) if previous != task => warnings.push(format!(
                    "File conflict: {} written by {} and {} (using {})",
                    path, previous, task, task
                )),
                _ => {}
            }
            writes.push(PlannedWrite {
                task: task.clone(),
                path,
                content: content.as_bytes().to_vec(),
            });
        }
        schema.extend(
            output
                .schema_changes
                .iter()
                .map(|change| StagedSchemaChange { task, change }),
        );
    }

    if let Some(last) = schema.last().map(|staged| staged.task.clone()) {
        let mut content = serde_json::to_vec_pretty(&schema)?;
        content.push(b'\n');
        writes.push(PlannedWrite {
            task: last,
            path: SCHEMA_CHANGES_FILE.to_string(),
            content,
        });
    }

    Ok(writes)
}

fn apply<'w>(
    tx: &mut StagingTransaction<'_>,
    writes: &'w [PlannedWrite],
) -> std::result::Result<(), (&'w PlannedWrite, Error)> {
    for write in writes {
        tx.write(&write.path, &write.content)
            .map_err(|e| (write, e))?;
    }
    Ok(())
}

fn roll_back(tx: StagingTransaction<'_>, result: &mut MergeResult) {
    match tx.rollback() {
        Ok(()) => result.rollbacks += 1,
        Err(e) => {
            cxlog_error!("Rollback incomplete: {}", e);
            result.errors.push(format!("Rollback incomplete: {}", e));
        }
    }
}
