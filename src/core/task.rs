//! Task and task-output data model.
//!
//! Tasks are produced by an upstream decomposition step and are immutable
//! once analysis begins. A [`TaskOutput`] is the declared side effect of one
//! completed task, written by the worker that ran it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path};

use crate::error::{Error, Result};

/// Duration assumed for a task that declares none.
pub const DEFAULT_DURATION: f64 = 1.0;

/// Unique identifier for a task within one orchestration cycle.
///
/// Ordering is lexicographic on the underlying string, which is what every
/// deterministic tie-break in the crate relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single unit of work in the dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Human-readable description of the work.
    #[serde(default)]
    pub description: String,
    /// Estimated duration, same unit across a run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl Task {
    /// Create a new task with the given id and description and no duration.
    pub fn new(id: &str, description: &str) -> Self {
        Self {
            id: TaskId::from(id),
            description: description.to_string(),
            duration: None,
        }
    }

    /// Set the estimated duration.
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Declared duration, or [`DEFAULT_DURATION`].
    pub fn effective_duration(&self) -> f64 {
        self.duration.unwrap_or(DEFAULT_DURATION)
    }
}

/// A task list entry: either a bare id or a full task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskEntry {
    Id(TaskId),
    Full(Task),
}

impl From<TaskEntry> for Task {
    fn from(entry: TaskEntry) -> Self {
        match entry {
            TaskEntry::Id(id) => Task {
                id,
                description: String::new(),
                duration: None,
            },
            TaskEntry::Full(task) => task,
        }
    }
}

/// Structural description of one API endpoint or interface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiContract {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default)]
    pub request: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub response: BTreeMap<String, serde_json::Value>,
    /// Source file implementing the contract, if declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl ApiContract {
    /// Names of the structural parts that differ from `other`.
    ///
    /// Request and response shapes are compared by field set; field types are
    /// not inspected.
    pub fn differences(&self, other: &ApiContract) -> Vec<&'static str> {
        let mut diffs = Vec::new();
        if self.method != other.method {
            diffs.push("method");
        }
        if !self.request.keys().eq(other.request.keys()) {
            diffs.push("request");
        }
        if !self.response.keys().eq(other.response.keys()) {
            diffs.push("response");
        }
        diffs
    }
}

/// Database schema operation declared by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaOperation {
    CreateTable,
    DropTable,
    AddColumn,
    DropColumn,
    RenameColumn,
    AlterColumn,
    AddIndex,
    DropIndex,
    Select,
    Insert,
    Update,
    Delete,
}

impl SchemaOperation {
    /// Whether this operation removes the column it names.
    pub fn removes_column(&self) -> bool {
        matches!(self, SchemaOperation::DropColumn | SchemaOperation::RenameColumn)
    }
}

impl std::fmt::Display for SchemaOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SchemaOperation::CreateTable => "create_table",
            SchemaOperation::DropTable => "drop_table",
            SchemaOperation::AddColumn => "add_column",
            SchemaOperation::DropColumn => "drop_column",
            SchemaOperation::RenameColumn => "rename_column",
            SchemaOperation::AlterColumn => "alter_column",
            SchemaOperation::AddIndex => "add_index",
            SchemaOperation::DropIndex => "drop_index",
            SchemaOperation::Select => "select",
            SchemaOperation::Insert => "insert",
            SchemaOperation::Update => "update",
            SchemaOperation::Delete => "delete",
        };
        write!(f, "{}", s)
    }
}

/// One schema mutation (or access) on a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChange {
    pub table: String,
    pub operation: SchemaOperation,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
    /// Migration or model file carrying the change, if declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl SchemaChange {
    pub fn new(table: &str, operation: SchemaOperation) -> Self {
        Self {
            table: table.to_string(),
            operation,
            details: serde_json::Value::Null,
            file: None,
        }
    }

    pub fn on_column(mut self, column: &str) -> Self {
        self.details = serde_json::json!({ "column": column });
        self
    }

    /// Column named by `details.column`, if any.
    pub fn column(&self) -> Option<&str> {
        self.details.get("column").and_then(|c| c.as_str())
    }
}

/// Declared side effects of one completed task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    #[serde(default)]
    pub modified_files: Vec<String>,
    #[serde(default)]
    pub api_contracts: BTreeMap<String, ApiContract>,
    /// Library name to declared version.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub schema_changes: Vec<SchemaChange>,
    /// New file contents to stage during merge, keyed by relative path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
    /// Resolution priority; higher wins.
    #[serde(default)]
    pub priority: i32,
}

impl TaskOutput {
    /// Check the output is well-formed before any algorithmic work.
    pub fn validate(&self, task: &TaskId) -> Result<()> {
        if task.as_str().trim().is_empty() {
            return Err(Error::Validation("Task output with empty task id".to_string()));
        }
        for path in self.modified_files.iter().chain(self.files.keys()) {
            validate_relative_path(path).map_err(|reason| {
                Error::Validation(format!("Task {}: path '{}' {}", task, path, reason))
            })?;
        }
        for change in &self.schema_changes {
            if change.table.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "Task {}: schema change '{}' has no table",
                    task, change.operation
                )));
            }
        }
        Ok(())
    }

    /// Every staging path this task modifies: `modified_files` plus the
    /// paths it ships content for, normalized.
    pub fn written_paths(&self) -> BTreeSet<String> {
        self.modified_files
            .iter()
            .chain(self.files.keys())
            .map(|path| normalize_path(path))
            .collect()
    }

    /// Whether `path` is named by one of this task's contracts or schema changes.
    pub fn has_structural_reference(&self, path: &str) -> bool {
        let path = normalize_path(path);
        let names = |file: &Option<String>| {
            file.as_deref()
                .is_some_and(|f| normalize_path(f) == path)
        };
        self.api_contracts
            .iter()
            .any(|(key, contract)| *key == path || names(&contract.file))
            || self.schema_changes.iter().any(|change| names(&change.file))
    }
}

/// Canonical staging-relative form of a path.
///
/// `.` segments, repeated separators and a trailing separator are dropped and
/// the remaining components are joined with `/`, so `./src//auth.py` and
/// `src/auth.py` name the same file.
pub fn normalize_path(path: &str) -> String {
    Path::new(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn validate_relative_path(path: &str) -> std::result::Result<(), &'static str> {
    if path.trim().is_empty() {
        return Err("is empty");
    }
    let p = Path::new(path);
    if p.is_absolute() {
        return Err("must be relative");
    }
    if p.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
        return Err("must not escape the staging area");
    }
    if normalize_path(path).is_empty() {
        return Err("does not name a file");
    }
    Ok(())
}
