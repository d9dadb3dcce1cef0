//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Temporary staging directories with whole-tree snapshots
//! - Task outputs built from JSON literals
//! - Predefined task graphs

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use conflux::core::{Task, TaskId, TaskOutput};
use conflux::orchestration::{AnalysisRequest, MergeCoordinator, StagingArea};

/// A temporary staging directory.
pub struct StagingDir {
    /// The temporary directory backing the staging area.
    pub temp_dir: TempDir,
    /// Path to the staging root.
    pub path: PathBuf,
}

impl StagingDir {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().to_path_buf();
        Self { temp_dir, path }
    }

    /// Create a file (and its parents) with the given content.
    pub fn write(&self, rel: &str, content: &str) {
        let path = self.path.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dirs");
        }
        fs::write(path, content).expect("Failed to write file");
    }

    pub fn read(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.path.join(rel)).ok()
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.path.join(rel).exists()
    }

    /// Every file and directory under the root with its bytes.
    ///
    /// Directories map to `None` so that an added empty directory still
    /// shows up as a difference.
    pub fn tree(&self) -> BTreeMap<PathBuf, Option<Vec<u8>>> {
        let mut entries = BTreeMap::new();
        collect(&self.path, &self.path, &mut entries);
        entries
    }

    pub fn coordinator(&self) -> MergeCoordinator {
        MergeCoordinator::new(StagingArea::new(&self.path))
    }
}

impl Default for StagingDir {
    fn default() -> Self {
        Self::new()
    }
}

fn collect(root: &Path, dir: &Path, entries: &mut BTreeMap<PathBuf, Option<Vec<u8>>>) {
    let Ok(read_dir) = fs::read_dir(dir) else {
        return;
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        if path.is_dir() {
            entries.insert(rel, None);
            collect(root, &path, entries);
        } else {
            entries.insert(rel, fs::read(&path).ok());
        }
    }
}

/// Parse a JSON object of task id to output.
pub fn outputs(value: serde_json::Value) -> BTreeMap<TaskId, TaskOutput> {
    serde_json::from_value(value).expect("Invalid task outputs fixture")
}

pub fn id(s: &str) -> TaskId {
    TaskId::from(s)
}

/// Create a test task with the given id.
pub fn test_task(name: &str) -> Task {
    Task::new(name, &format!("{} description", name))
}

/// Diamond-shaped request: A -> B, A -> C, B -> D, C -> D.
///
/// ```text
///     A
///    / \
///   B   C
///    \ /
///     D
/// ```
pub fn diamond_request() -> AnalysisRequest {
    AnalysisRequest::new(["A", "B", "C", "D"].iter().map(|n| test_task(n)).collect())
        .depends_on("B", "A")
        .depends_on("C", "A")
        .depends_on("D", "B")
        .depends_on("D", "C")
        .duration("A", 2.0)
        .duration("B", 5.0)
        .duration("C", 3.0)
        .duration("D", 1.0)
}

/// A deterministic pseudo-random DAG over `count` tasks.
///
/// Edges only point from a lower to a higher index, so the graph is acyclic
/// by construction; durations vary between 0.5 and 4.0.
pub fn generated_request(count: usize, salt: usize) -> AnalysisRequest {
    let names: Vec<String> = (0..count).map(|i| format!("t{:02}", i)).collect();
    let mut request = AnalysisRequest::new(names.iter().map(|n| test_task(n)).collect());
    for j in 0..count {
        for i in 0..j {
            if (i * 7 + j * 13 + salt) % 5 == 0 {
                request = request.depends_on(&names[j], &names[i]);
            }
        }
        let duration = 0.5 + ((j * 11 + salt) % 8) as f64 * 0.5;
        request = request.duration(&names[j], duration);
    }
    request
}

/// Outputs where two tasks share `auth.py` and nothing else overlaps.
pub fn auth_outputs() -> BTreeMap<TaskId, TaskOutput> {
    outputs(serde_json::json!({
        "login": {
            "modified_files": ["auth.py", "views/login.py"],
            "files": {"auth.py": "def login(): ...\n", "views/login.py": "LOGIN = True\n"}
        },
        "signup": {
            "modified_files": ["auth.py", "views/signup.py"],
            "files": {"auth.py": "def signup(): ...\n", "views/signup.py": "SIGNUP = True\n"}
        }
    }))
}
