//! Staging area for merge batches.
//!
//! Every write goes through a [`StagingTransaction`], which snapshots the
//! prior bytes (or absence) of each path before touching it and remembers
//! the directories it had to create, the staging root included when it did
//! not exist yet. [`StagingTransaction::rollback`] puts all of them back, so
//! a failed batch leaves no trace in the touched paths.
//!
//! Paths are keyed in normalized form: `./auth.py` and `auth.py` are one
//! entry with one snapshot.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use crate::core::normalize_path;
use crate::error::{Error, Result};
use crate::{cxlog, cxlog_debug, cxlog_error};

/// Pre-merge state of everything a transaction touched.
#[derive(Debug, Default)]
struct Snapshot {
    /// Relative path to prior content; `None` if the file did not exist.
    files: BTreeMap<PathBuf, Option<Vec<u8>>>,
    /// Directories created during the batch, outermost first.
    created_dirs: Vec<PathBuf>,
}

/// A directory merge batches are applied to.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a batch. The exclusive borrow keeps a single writer per area.
    pub fn begin(&mut self) -> StagingTransaction<'_> {
        cxlog_debug!("Staging transaction started in {}", self.root.display());
        StagingTransaction {
            area: self,
            snapshot: Snapshot::default(),
        }
    }

    /// Snapshot key for `rel`: its normalized form, checked to stay inside the root.
    fn key(rel: &str) -> Result<PathBuf> {
        let path = Path::new(rel);
        if path.is_absolute() || path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(Error::Validation(format!(
                "Path '{}' escapes the staging area",
                rel
            )));
        }
        let normalized = normalize_path(rel);
        if normalized.is_empty() {
            return Err(Error::Validation(format!("Path '{}' does not name a file", rel)));
        }
        Ok(PathBuf::from(normalized))
    }
}

/// One batch of staged writes, undoable as a whole.
#[derive(Debug)]
pub struct StagingTransaction<'a> {
    area: &'a mut StagingArea,
    snapshot: Snapshot,
}

impl StagingTransaction<'_> {
    pub fn root(&self) -> &Path {
        self.area.root()
    }

    /// Create the staging root if missing, recording it for rollback.
    pub fn ensure_root(&mut self) -> Result<()> {
        let root = self.area.root().to_path_buf();
        self.create_dirs(&root)
    }

    /// Write `content` to `rel`, snapshotting the prior state on first touch.
    pub fn write(&mut self, rel: &str, content: &[u8]) -> Result<()> {
        let key = StagingArea::key(rel)?;
        let target = self.area.root().join(&key);

        if !self.snapshot.files.contains_key(&key) {
            let prior = match fs::read(&target) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };
            self.snapshot.files.insert(key, prior);
        }

        if let Some(parent) = target.parent() {
            self.create_dirs(parent)?;
        }
        fs::write(&target, content)?;
        cxlog_debug!("Staged {} ({} bytes)", rel, content.len());
        Ok(())
    }

    fn create_dirs(&mut self, dir: &Path) -> Result<()> {
        let mut missing = Vec::new();
        let mut current = Some(dir);
        while let Some(d) = current {
            if d.as_os_str().is_empty() || d.exists() {
                break;
            }
            missing.push(d.to_path_buf());
            current = d.parent();
        }
        for d in missing.into_iter().rev() {
            fs::create_dir(&d)?;
            self.snapshot.created_dirs.push(d);
        }
        Ok(())
    }

    /// Relative paths written in this batch, sorted.
    pub fn written_files(&self) -> Vec<String> {
        self.snapshot
            .files
            .keys()
            .map(|p| p.to_string_lossy().into_owned())
            .collect()
    }

    /// Keep the staged writes.
    pub fn commit(self) -> Vec<String> {
        let files = self.written_files();
        cxlog!("Staging transaction committed ({} files)", files.len());
        files
    }

    /// Restore every touched path to its pre-batch state.
    ///
    /// Restoration continues past individual failures; the first error is
    /// returned once everything restorable has been restored.
    pub fn rollback(self) -> Result<()> {
        let root = self.area.root().to_path_buf();
        let mut first_error: Option<Error> = None;

        for (rel, prior) in &self.snapshot.files {
            let target = root.join(rel);
            let restored = match prior {
                Some(bytes) => fs::write(&target, bytes),
                None => match fs::remove_file(&target) {
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    other => other,
                },
            };
            if let Err(e) = restored {
                cxlog_error!("Rollback of {} failed: {}", rel.display(), e);
                first_error.get_or_insert(e.into());
            }
        }

        for dir in self.snapshot.created_dirs.iter().rev() {
            match fs::remove_dir_all(dir) {
                Err(e) if e.kind() != ErrorKind::NotFound => {
                    cxlog_error!("Rollback of directory {} failed: {}", dir.display(), e);
                    first_error.get_or_insert(e.into());
                }
                _ => {}
            }
        }

        cxlog!(
            "Staging transaction rolled back ({} files, {} directories)",
            self.snapshot.files.len(),
            self.snapshot.created_dirs.len()
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
