//! Orchestration core: dependency analysis, conflict detection and merge
//! coordination for batches of decomposed tasks.
//!
//! The analyzer and detector are pure functions of their input. The
//! coordinator is the only component with side effects (staging writes and
//! the verification subprocess) and owns its staging area exclusively.

mod analyzer;
mod coordinator;
mod detector;
mod staging;
mod verify;

pub use analyzer::{
    Analysis, AnalysisRequest, CycleDetails, CycleError, DependencyAnalyzer, DependencyReport,
    CYCLE_ERROR_CODE,
};
pub use coordinator::{
    MergeCoordinator, MergePlan, MergeRequest, MergeResult, MergeStatus, MergeStrategy,
    PlannedWrite, Resolution, ResolutionPolicy, SCHEMA_CHANGES_FILE,
};
pub use detector::{
    parse_version, Conflict, ConflictDetails, ConflictDetector, ConflictKind, ConflictReport,
    ConflictSummary, DetectorOptions, SchemaClash, Severity,
};
pub use staging::{StagingArea, StagingTransaction};
pub use verify::{VerificationOutcome, Verifier};
