//! Conflict detection across completed task outputs.
//!
//! Detection is pure: the same outputs always yield the same, identically
//! ordered conflict list. Four families are checked:
//!
//! - file: two or more tasks modify the same path
//! - semantic: two tasks declare diverging contracts for one endpoint
//! - dependency: tasks pin different versions of one library
//! - schema: one task's schema change invalidates another's

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::core::{ApiContract, SchemaChange, SchemaOperation, TaskId, TaskOutput};
use crate::error::Result;
use crate::{cxlog, cxlog_debug, cxlog_trace};

/// Leading `major[.minor[.patch]]` of a version string, after any range operator.
static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[=^~<>]=?|v)?\s*(\d+)(?:\.(\d+))?(?:\.(\d+))?").unwrap()
});

pub const STRATEGY_SERIALIZE: &str = "serialize";
pub const STRATEGY_PARTITION: &str = "partition file into separate files";
pub const STRATEGY_REGIONS: &str = "coordinate non-overlapping regions";
pub const STRATEGY_ADAPTER: &str = "add adapter layer";
pub const STRATEGY_VERSION_ENDPOINTS: &str = "version endpoints (v1, v2)";
pub const STRATEGY_ISOLATE: &str = "isolate via separate environment";
pub const STRATEGY_MANUAL: &str = "manual intervention required";

/// Conflict family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConflictKind {
    #[serde(rename = "file_conflict", alias = "file")]
    File,
    #[serde(rename = "semantic_conflict", alias = "semantic")]
    Semantic,
    #[serde(rename = "dependency_conflict", alias = "dependency")]
    Dependency,
    #[serde(rename = "schema_conflict", alias = "schema")]
    Schema,
}

impl ConflictKind {
    pub const ALL: [ConflictKind; 4] = [
        ConflictKind::File,
        ConflictKind::Semantic,
        ConflictKind::Dependency,
        ConflictKind::Schema,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::File => "file_conflict",
            ConflictKind::Semantic => "semantic_conflict",
            ConflictKind::Dependency => "dependency_conflict",
            ConflictKind::Schema => "schema_conflict",
        }
    }
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One pair of schema changes that cannot both be applied safely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaClash {
    pub first: TaskId,
    pub first_operation: SchemaOperation,
    pub second: TaskId,
    pub second_operation: SchemaOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub reason: String,
}

/// Type-specific conflict payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConflictDetails {
    File {
        file: String,
        /// Merge order that serializes the writers: ascending priority, then id.
        #[serde(default)]
        serialize_order: Vec<TaskId>,
        #[serde(default)]
        structural: bool,
    },
    Semantic {
        endpoint: String,
        differences: Vec<String>,
        contracts: BTreeMap<TaskId, ApiContract>,
    },
    Dependency {
        library: String,
        versions_by_task: BTreeMap<TaskId, String>,
        higher_version: String,
    },
    Schema {
        table: String,
        clashes: Vec<SchemaClash>,
    },
    /// Payload from an externally produced report this crate does not model.
    Other(serde_json::Value),
}

/// A detected incompatibility between task outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    pub subtype: String,
    pub severity: Severity,
    /// Implicated tasks, sorted by id.
    pub tasks: Vec<TaskId>,
    pub details: ConflictDetails,
    pub resolution_strategies: Vec<String>,
    pub recommended: String,
    #[serde(default = "default_auto_resolvable")]
    pub auto_resolvable: bool,
}

fn default_auto_resolvable() -> bool {
    true
}

impl Conflict {
    /// Lexicographically smallest implicated task.
    pub fn first_task(&self) -> Option<&TaskId> {
        self.tasks.iter().min()
    }

    /// Serialization order for a file conflict, when the report carries one.
    pub fn serialize_order(&self) -> Option<&[TaskId]> {
        match &self.details {
            ConflictDetails::File {
                serialize_order, ..
            } if !serialize_order.is_empty() => Some(serialize_order),
            _ => None,
        }
    }

    /// Reporting order: severity descending, then smallest task id.
    /// The remaining keys only make the order total.
    fn report_cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .severity
            .cmp(&self.severity)
            .then_with(|| self.first_task().cmp(&other.first_task()))
            .then_with(|| self.kind.cmp(&other.kind))
            .then_with(|| self.tasks.cmp(&other.tasks))
            .then_with(|| self.subtype.cmp(&other.subtype))
            .then_with(|| detail_key(&self.details).cmp(&detail_key(&other.details)))
    }
}

fn detail_key(details: &ConflictDetails) -> String {
    serde_json::to_string(details).unwrap_or_default()
}

/// Counts of conflicts by severity and by type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictSummary {
    pub total: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_type: BTreeMap<ConflictKind, usize>,
    /// Whether any conflict is critical.
    #[serde(default)]
    pub critical: bool,
}

impl ConflictSummary {
    pub fn from_conflicts(conflicts: &[Conflict]) -> Self {
        let mut summary = Self {
            total: conflicts.len(),
            ..Default::default()
        };
        for conflict in conflicts {
            *summary.by_severity.entry(conflict.severity).or_default() += 1;
            *summary.by_type.entry(conflict.kind).or_default() += 1;
        }
        summary.critical = summary.by_severity.contains_key(&Severity::Critical);
        summary
    }
}

/// Output of [`ConflictDetector::detect`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub conflicts: Vec<Conflict>,
    #[serde(default)]
    pub conflict_summary: ConflictSummary,
}

impl ConflictReport {
    pub fn new(mut conflicts: Vec<Conflict>) -> Self {
        conflicts.sort_by(Conflict::report_cmp);
        let conflict_summary = ConflictSummary::from_conflicts(&conflicts);
        Self {
            conflicts,
            conflict_summary,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    pub fn has_critical(&self) -> bool {
        self.conflicts.iter().any(|c| c.severity == Severity::Critical)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DetectorOptions {
    /// Restrict detection to one family.
    pub only: Option<ConflictKind>,
    /// The merge step can apply region-level patches, so overlapping file
    /// edits are recommended for coordination instead of serialization.
    pub fine_grained_patching: bool,
}

/// Stateless pairwise conflict detector.
#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    options: DetectorOptions,
}

impl ConflictDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: DetectorOptions) -> Self {
        Self { options }
    }

    fn enabled(&self, kind: ConflictKind) -> bool {
        self.options.only.map_or(true, |only| only == kind)
    }

    /// Validate every output, then run each enabled check.
    pub fn detect(&self, outputs: &BTreeMap<TaskId, TaskOutput>) -> Result<ConflictReport> {
        for (task, output) in outputs {
            output.validate(task)?;
        }

        let mut conflicts = Vec::new();
        if self.enabled(ConflictKind::File) {
            conflicts.extend(self.file_conflicts(outputs));
        }
        if self.enabled(ConflictKind::Semantic) {
            conflicts.extend(self.semantic_conflicts(outputs));
        }
        if self.enabled(ConflictKind::Dependency) {
            conflicts.extend(self.dependency_conflicts(outputs));
        }
        if self.enabled(ConflictKind::Schema) {
            conflicts.extend(self.schema_conflicts(outputs));
        }

        let report = ConflictReport::new(conflicts);
        cxlog!(
            "Detected {} conflicts across {} task outputs (critical={})",
            report.conflict_summary.total,
            outputs.len(),
            report.conflict_summary.critical
        );
        Ok(report)
    }

    /// One conflict per path written by more than one task.
    ///
    /// A task writes the paths it lists in `modified_files` and the paths it
    /// ships content for in `files`; both are compared in normalized form.
    pub fn file_conflicts(&self, outputs: &BTreeMap<TaskId, TaskOutput>) -> Vec<Conflict> {
        let mut by_file: BTreeMap<String, Vec<&TaskId>> = BTreeMap::new();
        for (task, output) in outputs {
            for file in output.written_paths() {
                by_file.entry(file).or_default().push(task);
            }
        }

        let mut conflicts = Vec::new();
        for (file, writers) in by_file {
            if writers.len() < 2 {
                continue;
            }
            let structural = writers
                .iter()
                .any(|task| outputs[*task].has_structural_reference(&file));
            let severity = if structural {
                Severity::High
            } else {
                Severity::Medium
            };

            let mut serialize_order: Vec<TaskId> = writers.iter().map(|t| (*t).clone()).collect();
            serialize_order.sort_by(|a, b| {
                outputs[a]
                    .priority
                    .cmp(&outputs[b].priority)
                    .then_with(|| a.cmp(b))
            });

            let serialize = format!(
                "{} (execute {})",
                STRATEGY_SERIALIZE,
                join_ids(&serialize_order, " then ")
            );
            let recommended = if self.options.fine_grained_patching {
                STRATEGY_REGIONS.to_string()
            } else {
                serialize.clone()
            };
            cxlog_trace!("file conflict on {} between {:?}", file, serialize_order);

            let mut tasks = serialize_order.clone();
            tasks.sort();
            conflicts.push(Conflict {
                kind: ConflictKind::File,
                subtype: "both_modified".to_string(),
                severity,
                tasks,
                details: ConflictDetails::File {
                    file: file.to_string(),
                    serialize_order,
                    structural,
                },
                resolution_strategies: vec![
                    serialize,
                    STRATEGY_PARTITION.to_string(),
                    STRATEGY_REGIONS.to_string(),
                ],
                recommended,
                auto_resolvable: true,
            });
        }
        conflicts
    }

    /// Pairwise contract comparison per endpoint key.
    pub fn semantic_conflicts(&self, outputs: &BTreeMap<TaskId, TaskOutput>) -> Vec<Conflict> {
        let mut by_endpoint: BTreeMap<&str, Vec<(&TaskId, &ApiContract)>> = BTreeMap::new();
        for (task, output) in outputs {
            for (endpoint, contract) in &output.api_contracts {
                by_endpoint
                    .entry(endpoint.as_str())
                    .or_default()
                    .push((task, contract));
            }
        }

        let mut conflicts = Vec::new();
        for (endpoint, declared) in by_endpoint {
            for (i, (task_a, contract_a)) in declared.iter().enumerate() {
                for (task_b, contract_b) in &declared[i + 1..] {
                    let differences = contract_a.differences(contract_b);
                    cxlog_trace!(
                        "contract {} {} vs {}: {:?}",
                        endpoint,
                        task_a,
                        task_b,
                        differences
                    );
                    if differences.is_empty() {
                        continue;
                    }

                    let (prio_a, prio_b) = (outputs[*task_a].priority, outputs[*task_b].priority);
                    let align = match prio_a.cmp(&prio_b) {
                        std::cmp::Ordering::Equal => {
                            "align contracts (update one to match the other)".to_string()
                        }
                        std::cmp::Ordering::Less => {
                            format!("align contracts (conform {} to {})", task_a, task_b)
                        }
                        std::cmp::Ordering::Greater => {
                            format!("align contracts (conform {} to {})", task_b, task_a)
                        }
                    };

                    let contracts = [
                        ((*task_a).clone(), (*contract_a).clone()),
                        ((*task_b).clone(), (*contract_b).clone()),
                    ]
                    .into_iter()
                    .collect();

                    conflicts.push(Conflict {
                        kind: ConflictKind::Semantic,
                        subtype: "api_contract_mismatch".to_string(),
                        severity: Severity::High,
                        tasks: vec![(*task_a).clone(), (*task_b).clone()],
                        details: ConflictDetails::Semantic {
                            endpoint: endpoint.to_string(),
                            differences: differences.iter().map(|d| d.to_string()).collect(),
                            contracts,
                        },
                        resolution_strategies: vec![
                            align.clone(),
                            STRATEGY_ADAPTER.to_string(),
                            STRATEGY_VERSION_ENDPOINTS.to_string(),
                        ],
                        recommended: align,
                        auto_resolvable: true,
                    });
                }
            }
        }
        conflicts
    }

    /// Libraries declared at more than one version.
    ///
    /// Versions are compared as trimmed strings: `1.2` and `1.2.0` conflict.
    pub fn dependency_conflicts(&self, outputs: &BTreeMap<TaskId, TaskOutput>) -> Vec<Conflict> {
        let mut by_library: BTreeMap<&str, BTreeMap<TaskId, String>> = BTreeMap::new();
        for (task, output) in outputs {
            for (library, version) in &output.dependencies {
                by_library
                    .entry(library.as_str())
                    .or_default()
                    .insert(task.clone(), version.trim().to_string());
            }
        }

        let mut conflicts = Vec::new();
        for (library, versions_by_task) in by_library {
            let mut distinct: Vec<&str> = versions_by_task.values().map(String::as_str).collect();
            distinct.sort();
            distinct.dedup();
            if distinct.len() < 2 {
                continue;
            }

            let higher_version = distinct
                .iter()
                .copied()
                .max_by(|a, b| {
                    parse_version(a)
                        .cmp(&parse_version(b))
                        .then_with(|| a.cmp(b))
                })
                .unwrap_or_default()
                .to_string();
            cxlog_debug!(
                "dependency conflict on {}: {:?} (higher {})",
                library,
                distinct,
                higher_version
            );

            let pin = format!("pin to higher version ({})", higher_version);
            conflicts.push(Conflict {
                kind: ConflictKind::Dependency,
                subtype: "version_mismatch".to_string(),
                severity: Severity::Medium,
                tasks: versions_by_task.keys().cloned().collect(),
                details: ConflictDetails::Dependency {
                    library: library.to_string(),
                    versions_by_task,
                    higher_version,
                },
                resolution_strategies: vec![pin.clone(), STRATEGY_ISOLATE.to_string()],
                recommended: pin,
                auto_resolvable: true,
            });
        }
        conflicts
    }

    /// Cross-task schema changes on one table that invalidate each other.
    ///
    /// All clashes between the same two tasks on one table are reported as a
    /// single conflict. Schema conflicts are never auto-resolvable.
    pub fn schema_conflicts(&self, outputs: &BTreeMap<TaskId, TaskOutput>) -> Vec<Conflict> {
        let mut by_table: BTreeMap<&str, Vec<(&TaskId, &SchemaChange)>> = BTreeMap::new();
        for (task, output) in outputs {
            for change in &output.schema_changes {
                by_table
                    .entry(change.table.as_str())
                    .or_default()
                    .push((task, change));
            }
        }

        let mut conflicts = Vec::new();
        for (table, changes) in by_table {
            let mut by_pair: BTreeMap<(&TaskId, &TaskId), Vec<SchemaClash>> = BTreeMap::new();
            for (i, (task_a, change_a)) in changes.iter().enumerate() {
                for (task_b, change_b) in &changes[i + 1..] {
                    if task_a == task_b {
                        continue;
                    }
                    if let Some(clash) = schema_clash(task_a, change_a, task_b, change_b) {
                        by_pair.entry((*task_a, *task_b)).or_default().push(clash);
                    }
                }
            }

            for ((task_a, task_b), clashes) in by_pair {
                let subtype = clashes
                    .first()
                    .map(|c| c.reason.clone())
                    .unwrap_or_default();
                cxlog_debug!(
                    "schema conflict on {} between {} and {}: {}",
                    table,
                    task_a,
                    task_b,
                    subtype
                );
                conflicts.push(Conflict {
                    kind: ConflictKind::Schema,
                    subtype,
                    severity: Severity::Critical,
                    tasks: vec![task_a.clone(), task_b.clone()],
                    details: ConflictDetails::Schema {
                        table: table.to_string(),
                        clashes,
                    },
                    resolution_strategies: vec![
                        STRATEGY_MANUAL.to_string(),
                        format!("{} (ensure correct migration order)", STRATEGY_SERIALIZE),
                        "remove dependency on the changed schema".to_string(),
                    ],
                    recommended: STRATEGY_MANUAL.to_string(),
                    auto_resolvable: false,
                });
            }
        }
        conflicts
    }
}

fn join_ids(ids: &[TaskId], sep: &str) -> String {
    ids.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(sep)
}

/// Numeric `(major, minor, patch)` prefix, missing parts as 0.
pub fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let caps = VERSION_RE.captures(version)?;
    let part = |i: usize| {
        caps.get(i)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(0)
    };
    Some((part(1), part(2), part(3)))
}

/// Whether applying `a` leaves `b` pointing at something that no longer exists.
fn invalidates(a: &SchemaChange, b: &SchemaChange) -> Option<&'static str> {
    if a.operation == SchemaOperation::DropTable {
        return Some("table_dropped");
    }
    if a.operation.removes_column() {
        let same_column = match (a.column(), b.column()) {
            (Some(x), Some(y)) => x == y,
            _ => true,
        };
        if same_column {
            return Some("column_removed");
        }
    }
    None
}

fn schema_clash(
    task_a: &TaskId,
    a: &SchemaChange,
    task_b: &TaskId,
    b: &SchemaChange,
) -> Option<SchemaClash> {
    let column = a.column().or(b.column()).map(str::to_string);
    let reason = invalidates(a, b)
        .or_else(|| invalidates(b, a))
        .or_else(|| match (a.operation, b.operation) {
            (SchemaOperation::AddColumn, SchemaOperation::AddColumn)
                if a.column().is_some() && a.column() == b.column() =>
            {
                Some("duplicate_column")
            }
            (SchemaOperation::CreateTable, SchemaOperation::CreateTable) => Some("duplicate_table"),
            _ => None,
        })?;

    Some(SchemaClash {
        first: task_a.clone(),
        first_operation: a.operation,
        second: task_b.clone(),
        second_operation: b.operation,
        column,
        reason: reason.to_string(),
    })
}
