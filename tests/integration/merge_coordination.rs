//! Merge coordination integration tests.
//!
//! These tests run whole merges against temporary staging directories:
//! - Dry runs plan exactly what a real run applies and write nothing
//! - Failed or timed-out verification leaves the staging area untouched
//! - Identical input yields identical results

use serde_json::json;
use std::time::Duration;

use conflux::orchestration::{
    AnalysisRequest, ConflictDetector, DependencyAnalyzer, MergeCoordinator, MergeRequest,
    MergeStatus, ResolutionPolicy, StagingArea, SCHEMA_CHANGES_FILE,
};

use crate::fixtures::{auth_outputs, id, outputs, test_task, StagingDir};

/// Test: Successful merge of conflicting tasks
/// Given login and signup both writing auth.py
/// When they are merged with the default serialize policy
/// Then both are merged in priority-then-id order and the later writer wins
#[tokio::test]
async fn test_serialized_merge_applies_in_order() {
    let staging = StagingDir::new();
    let mut coordinator = staging.coordinator();

    let result = coordinator
        .merge(&MergeRequest::new(auth_outputs()).verify("true"))
        .await
        .unwrap();

    assert_eq!(result.status, MergeStatus::Success);
    assert_eq!(result.merge_order, vec![id("login"), id("signup")]);
    assert_eq!(result.merged_tasks, result.merge_order);
    assert_eq!(result.conflicts_resolved, 1);
    assert_eq!(
        result.resolutions[0].action,
        "Execute tasks in order: login -> signup"
    );
    assert_eq!(result.verification.tests_passed, Some(true));
    assert_eq!(
        result.merged_files,
        vec!["auth.py", "views/login.py", "views/signup.py"]
    );

    assert_eq!(staging.read("auth.py").as_deref(), Some("def signup(): ...\n"));
    assert!(staging.exists("views/login.py"));
    assert!(staging.exists("views/signup.py"));
}

/// Test: Dry run mirrors the real run
/// Given a staging area with existing content
/// When the same batch is merged as a dry run and then for real
/// Then both report the same order and the dry run leaves the tree untouched
#[tokio::test]
async fn test_dry_run_plans_real_order_without_writing() {
    let staging = StagingDir::new();
    staging.write("README.md", "existing\n");
    let before = staging.tree();
    let mut coordinator = staging.coordinator();

    let request = MergeRequest::new(auth_outputs()).verify("true");
    let dry = coordinator
        .merge(&request.clone().dry_run(true))
        .await
        .unwrap();

    assert_eq!(dry.status, MergeStatus::DryRun);
    assert_eq!(dry.verification.tests_passed, None);
    assert!(dry.verification.output.starts_with("Verification skipped (dry run)"));
    assert_eq!(staging.tree(), before, "dry run must not write");

    let real = coordinator.merge(&request).await.unwrap();
    assert_eq!(real.status, MergeStatus::Success);
    assert_eq!(dry.merge_order, real.merge_order);
    assert_eq!(dry.merged_files, real.merged_files);
    assert_eq!(dry.resolutions, real.resolutions);
}

/// Test: Failed verification rolls back
/// Given existing files, including one a task overwrites
/// When verification exits non-zero
/// Then the staging tree is byte-identical to before and one rollback is recorded
#[tokio::test]
async fn test_failed_verification_restores_tree() {
    let staging = StagingDir::new();
    staging.write("auth.py", "ORIGINAL = True\n");
    staging.write("docs/notes.md", "keep me\n");
    let before = staging.tree();
    let mut coordinator = staging.coordinator();

    let mut outs = auth_outputs();
    outs.get_mut(&id("login"))
        .unwrap()
        .schema_changes
        .push(serde_json::from_value(json!({"table": "users", "operation": "add_column", "details": {"column": "last_login"}})).unwrap());

    let result = coordinator
        .merge(&MergeRequest::new(outs).verify("echo checking; false"))
        .await
        .unwrap();

    assert_eq!(result.status, MergeStatus::Failed);
    assert_eq!(result.rollbacks, 1);
    assert_eq!(result.verification.tests_passed, Some(false));
    assert!(result.verification.output.contains("checking"));
    assert!(result.errors.iter().any(|e| e == "Verification failed"));
    assert_eq!(staging.tree(), before);
    assert!(!staging.exists(SCHEMA_CHANGES_FILE));
}

/// Test: Rollback disabled
/// Given a failing verification command and rollback turned off
/// When the batch is merged
/// Then the merge fails but the staged files stay in place
#[tokio::test]
async fn test_failed_verification_without_rollback_keeps_changes() {
    let staging = StagingDir::new();
    let mut coordinator = staging.coordinator();

    let result = coordinator
        .merge(
            &MergeRequest::new(auth_outputs())
                .verify("exit 3")
                .rollback_on_failure(false),
        )
        .await
        .unwrap();

    assert!(result.is_failed());
    assert_eq!(result.rollbacks, 0);
    assert!(staging.exists("auth.py"));
    assert!(result
        .warnings
        .iter()
        .any(|w| w.starts_with("Rollback disabled")));
}

/// Test: Verification timeout
/// Given a verification command that outlives a one second limit
/// When the batch is merged
/// Then the merge fails, reports a timeout and rolls back
#[tokio::test]
async fn test_verification_timeout_fails_merge() {
    let staging = StagingDir::new();
    let before = staging.tree();
    let mut coordinator = staging.coordinator();

    let result = coordinator
        .merge(
            &MergeRequest::new(auth_outputs())
                .verify("sleep 10")
                .verify_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    assert_eq!(result.status, MergeStatus::Failed);
    assert!(result.verification.timed_out);
    assert_eq!(result.verification.tests_passed, Some(false));
    assert!(result.verification.output.starts_with("Verification timed out"));
    assert_eq!(result.rollbacks, 1);
    assert_eq!(staging.tree(), before);
}

/// Test: Critical conflicts block the merge
/// Given two tasks whose schema changes invalidate each other
/// When the batch is merged
/// Then nothing is staged and the conflict is escalated
#[tokio::test]
async fn test_schema_conflict_blocks_merge() {
    let staging = StagingDir::new();
    let before = staging.tree();
    let mut coordinator = staging.coordinator();

    let outs = outputs(json!({
        "drop": {
            "schema_changes": [{"table": "orders", "operation": "drop_table"}],
            "files": {"migrations/001.sql": "DROP TABLE orders;\n"}
        },
        "extend": {
            "schema_changes": [{"table": "orders", "operation": "add_column", "details": {"column": "note"}}],
            "files": {"migrations/002.sql": "ALTER TABLE orders ADD note TEXT;\n"}
        }
    }));
    let result = coordinator.merge(&MergeRequest::new(outs)).await.unwrap();

    assert!(result.is_failed());
    assert_eq!(result.rollbacks, 0);
    assert_eq!(result.conflicts_resolved, 0);
    assert_eq!(result.resolutions.len(), 1);
    assert_eq!(result.resolutions[0].strategy, ResolutionPolicy::Manual);
    assert!(!result.errors.is_empty());
    assert_eq!(staging.tree(), before);
}

/// Test: Skip policy removes conflicting tasks and their dependents
/// Given two tasks sharing auth.py and a third depending on one of them
/// When merged with the skip policy
/// Then only the unrelated task is merged
#[tokio::test]
async fn test_skip_policy_propagates_to_dependents() {
    let staging = StagingDir::new();
    let mut coordinator = staging.coordinator();

    let mut outs = auth_outputs();
    outs.extend(outputs(json!({
        "emails": {"files": {"mail.py": "SEND = True\n"}},
        "welcome": {"files": {"welcome.py": "HELLO = True\n"}}
    })));
    let request = MergeRequest::new(outs)
        .depends_on("welcome", "signup")
        .with_resolution(ResolutionPolicy::Skip);

    let result = coordinator.merge(&request).await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.merge_order, vec![id("emails")]);
    assert_eq!(
        result.skipped_tasks,
        vec![id("login"), id("signup"), id("welcome")]
    );
    assert!(staging.exists("mail.py"));
    assert!(!staging.exists("auth.py"));
    assert!(!staging.exists("welcome.py"));
}

/// Test: Precomputed conflict report is honored
/// Given a report that marks two unrelated tasks as a file conflict with an explicit order
/// When the batch is merged with that report
/// Then the report's order is used instead of re-detecting
#[tokio::test]
async fn test_supplied_report_drives_order() {
    let staging = StagingDir::new();
    let mut coordinator = staging.coordinator();

    let outs = outputs(json!({
        "a": {"files": {"a.txt": "a\n"}},
        "b": {"files": {"b.txt": "b\n"}}
    }));
    let report = serde_json::from_value(json!({
        "conflicts": [{
            "type": "file_conflict",
            "subtype": "both_modified",
            "severity": "medium",
            "tasks": ["a", "b"],
            "details": {"file": "shared.txt", "serialize_order": ["b", "a"]},
            "resolution_strategies": ["serialize"],
            "recommended": "serialize"
        }]
    }))
    .unwrap();

    let result = coordinator
        .merge(&MergeRequest::new(outs).with_conflicts(report))
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.merge_order, vec![id("b"), id("a")]);
    assert_eq!(result.conflicts_resolved, 1);
}

/// Test: Conflict-free merge follows dependency analysis
/// Given independent outputs with declared dependencies
/// When the batch is merged
/// Then the merge order equals the analyzer's topological order
#[tokio::test]
async fn test_conflict_free_order_matches_analyzer() {
    let staging = StagingDir::new();
    let mut coordinator = staging.coordinator();

    let outs = outputs(json!({
        "api": {"files": {"api.py": "API\n"}},
        "db": {"files": {"db.py": "DB\n"}},
        "models": {"files": {"models.py": "MODELS\n"}},
        "ui": {"files": {"ui.py": "UI\n"}}
    }));
    assert!(ConflictDetector::new().detect(&outs).unwrap().is_empty());

    let request = MergeRequest::new(outs)
        .depends_on("models", "db")
        .depends_on("api", "models")
        .depends_on("ui", "api");
    let analysis = DependencyAnalyzer::new()
        .analyze(
            &AnalysisRequest::new(["api", "db", "models", "ui"].iter().map(|n| test_task(n)).collect())
                .depends_on("models", "db")
                .depends_on("api", "models")
                .depends_on("ui", "api"),
        )
        .unwrap();

    let result = coordinator.merge(&request).await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.merge_order, analysis.report().unwrap().topological_order);
    assert_eq!(result.merge_order, vec![id("db"), id("models"), id("api"), id("ui")]);
}

/// Test: Cyclic dependencies fail the merge
/// Given two outputs depending on each other
/// When the batch is merged
/// Then the merge fails naming the cycle and nothing is written
#[tokio::test]
async fn test_cycle_fails_merge() {
    let staging = StagingDir::new();
    let mut coordinator = staging.coordinator();

    let request = MergeRequest::new(outputs(json!({
        "a": {"files": {"a.txt": "a\n"}},
        "b": {"files": {"b.txt": "b\n"}}
    })))
    .depends_on("a", "b")
    .depends_on("b", "a");

    let result = coordinator.merge(&request).await.unwrap();

    assert!(result.is_failed());
    assert!(result.merge_order.is_empty());
    assert_eq!(result.errors, vec!["Circular dependency detected: a -> b -> a"]);
    assert!(staging.tree().is_empty());
}

/// Test: Merges are idempotent
/// Given the same batch against two fresh staging areas, and repeated dry runs
/// When each is merged
/// Then the results and the resulting trees are identical
#[tokio::test]
async fn test_identical_input_yields_identical_results() {
    let request = MergeRequest::new(auth_outputs()).verify("true");

    let first_dir = StagingDir::new();
    let second_dir = StagingDir::new();
    let first = first_dir.coordinator().merge(&request).await.unwrap();
    let second = second_dir.coordinator().merge(&request).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
    assert_eq!(first_dir.tree(), second_dir.tree());

    let mut coordinator = first_dir.coordinator();
    let dry = request.clone().dry_run(true);
    let dry_first = coordinator.merge(&dry).await.unwrap();
    let dry_second = coordinator.merge(&dry).await.unwrap();
    assert_eq!(dry_first, dry_second);
}

/// Test: Shipped content alone makes tasks conflict
/// Given two tasks that only ship shared.txt through `files`, the first with priority 5
/// When they are merged
/// Then the conflict is resolved by serializing so the higher-priority content lands last
#[tokio::test]
async fn test_shipped_files_are_serialized_by_priority() {
    let staging = StagingDir::new();
    let mut coordinator = staging.coordinator();
    let outs = outputs(json!({
        "a": {"files": {"shared.txt": "from a"}, "priority": 5},
        "b": {"files": {"shared.txt": "from b"}}
    }));

    let result = coordinator.merge(&MergeRequest::new(outs)).await.unwrap();

    assert_eq!(result.status, MergeStatus::Success);
    assert_eq!(result.conflicts_resolved, 1);
    assert_eq!(result.merge_order, vec![id("b"), id("a")]);
    assert_eq!(result.merged_files, vec!["shared.txt"]);
    assert_eq!(staging.read("shared.txt").as_deref(), Some("from a"));
}

/// Test: Two spellings of one path roll back as one file
/// Given an existing auth.py and tasks writing ./auth.py and auth.py
/// When verification fails
/// Then the conflict was detected, one path was staged and the original bytes come back
#[tokio::test]
async fn test_equivalent_paths_conflict_and_roll_back() {
    let staging = StagingDir::new();
    staging.write("auth.py", "ORIGINAL = True\n");
    let before = staging.tree();
    let mut coordinator = staging.coordinator();
    let outs = outputs(json!({
        "login": {"files": {"./auth.py": "def login(): ...\n"}},
        "signup": {"modified_files": ["auth.py"], "files": {"auth.py": "def signup(): ...\n"}}
    }));

    let result = coordinator
        .merge(&MergeRequest::new(outs).verify("false"))
        .await
        .unwrap();

    assert_eq!(result.conflicts_resolved, 1);
    assert_eq!(result.merge_order, vec![id("login"), id("signup")]);
    assert_eq!(result.merged_files, vec!["auth.py"]);
    assert_eq!(result.status, MergeStatus::Failed);
    assert_eq!(result.rollbacks, 1);
    assert_eq!(staging.tree(), before);
}

/// Test: A staging root created by the merge is removed on rollback
/// Given a staging path that does not exist yet
/// When the batch fails verification
/// Then the merge rolls back and no directory is left behind
#[tokio::test]
async fn test_rollback_removes_created_staging_root() {
    let staging = StagingDir::new();
    let root = staging.path.join("new").join("stage");
    let mut coordinator = MergeCoordinator::new(StagingArea::new(&root));

    let result = coordinator
        .merge(&MergeRequest::new(auth_outputs()).verify("test -f auth.py && false"))
        .await
        .unwrap();

    assert_eq!(result.status, MergeStatus::Failed);
    assert_eq!(result.rollbacks, 1);
    assert_eq!(result.verification.tests_passed, Some(false));
    assert!(!staging.exists("new"));
    assert!(staging.tree().is_empty());
}
