//! Conflict detection integration tests.
//!
//! These tests feed realistic batches of task outputs through the detector
//! and check the report as a consumer would read it.

use serde_json::json;

use conflux::orchestration::{
    ConflictDetails, ConflictDetector, ConflictKind, ConflictReport, DetectorOptions, Severity,
};

use crate::fixtures::{auth_outputs, id, outputs};

/// Test: Shared file between two tasks
/// Given login and signup both modifying auth.py
/// When conflicts are detected
/// Then exactly one file conflict names both tasks and the shared path
#[test]
fn test_shared_file_conflict() {
    let report = ConflictDetector::new().detect(&auth_outputs()).unwrap();

    assert_eq!(report.conflicts.len(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.kind, ConflictKind::File);
    assert_eq!(conflict.subtype, "both_modified");
    assert_eq!(conflict.severity, Severity::Medium);
    assert_eq!(conflict.tasks, vec![id("login"), id("signup")]);
    assert!(conflict.auto_resolvable);
    assert_eq!(conflict.recommended, "serialize (execute login then signup)");

    match &conflict.details {
        ConflictDetails::File { file, .. } => assert_eq!(file, "auth.py"),
        other => panic!("expected file details, got {:?}", other),
    }
}

/// Test: Priority drives serialization order
/// Given two writers of one file where the later id has the lower priority
/// When conflicts are detected
/// Then the lower-priority task is merged first so the higher one wins
#[test]
fn test_serialize_order_follows_priority() {
    let outs = outputs(json!({
        "alpha": {"modified_files": ["config.yaml"], "priority": 5},
        "beta": {"modified_files": ["config.yaml"], "priority": 1}
    }));
    let report = ConflictDetector::new().detect(&outs).unwrap();

    let conflict = &report.conflicts[0];
    assert_eq!(
        conflict.serialize_order(),
        Some(&[id("beta"), id("alpha")][..])
    );
    assert_eq!(conflict.recommended, "serialize (execute beta then alpha)");
}

/// Test: Incompatible API contracts
/// Given two tasks declaring POST /users with different request fields
/// When conflicts are detected
/// Then one high-severity semantic conflict lists the request difference
#[test]
fn test_incompatible_contracts_conflict() {
    let outs = outputs(json!({
        "api": {"api_contracts": {"POST /users": {
            "method": "POST", "request": {"name": "string"}, "response": {"id": "int"}
        }}},
        "client": {"api_contracts": {"POST /users": {
            "method": "POST", "request": {"username": "string"}, "response": {"id": "int"}
        }}}
    }));
    let report = ConflictDetector::new().detect(&outs).unwrap();

    assert_eq!(report.conflicts.len(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.kind, ConflictKind::Semantic);
    assert_eq!(conflict.severity, Severity::High);
    match &conflict.details {
        ConflictDetails::Semantic {
            endpoint,
            differences,
            ..
        } => {
            assert_eq!(endpoint, "POST /users");
            assert_eq!(differences, &vec!["request".to_string()]);
        }
        other => panic!("expected semantic details, got {:?}", other),
    }
}

/// Test: Identical API contracts
/// Given two tasks declaring the same contract for one endpoint
/// When conflicts are detected
/// Then the report is empty
#[test]
fn test_identical_contracts_do_not_conflict() {
    let contract = json!({"method": "GET", "request": {}, "response": {"items": "list"}});
    let outs = outputs(json!({
        "a": {"api_contracts": {"GET /items": contract.clone()}},
        "b": {"api_contracts": {"GET /items": contract}}
    }));
    let report = ConflictDetector::new().detect(&outs).unwrap();

    assert!(report.is_empty());
    assert_eq!(report.conflict_summary.total, 0);
    assert!(!report.conflict_summary.critical);
}

/// Test: Library version mismatch
/// Given two tasks pinning different versions of one library
/// When conflicts are detected
/// Then a medium dependency conflict recommends the higher version
#[test]
fn test_version_mismatch_pins_higher() {
    let outs = outputs(json!({
        "a": {"dependencies": {"requests": "2.28.0", "flask": "3.0"}},
        "b": {"dependencies": {"requests": "2.31.0", "flask": "3.0"}}
    }));
    let report = ConflictDetector::new().detect(&outs).unwrap();

    assert_eq!(report.conflicts.len(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.kind, ConflictKind::Dependency);
    assert_eq!(conflict.severity, Severity::Medium);
    assert_eq!(conflict.recommended, "pin to higher version (2.31.0)");
}

/// Test: Schema conflicts are never auto-resolvable
/// Given one task dropping a column another task renames, and two tasks creating one table
/// When conflicts are detected
/// Then every schema conflict is critical and requires manual resolution
#[test]
fn test_schema_conflicts_are_critical() {
    let outs = outputs(json!({
        "cleanup": {"schema_changes": [
            {"table": "users", "operation": "drop_column", "details": {"column": "email"}}
        ]},
        "profile": {"schema_changes": [
            {"table": "users", "operation": "rename_column", "details": {"column": "email"}},
            {"table": "audit", "operation": "create_table"}
        ]},
        "tracking": {"schema_changes": [
            {"table": "audit", "operation": "create_table"}
        ]}
    }));
    let report = ConflictDetector::new().detect(&outs).unwrap();

    assert_eq!(report.conflicts.len(), 2);
    for conflict in &report.conflicts {
        assert_eq!(conflict.kind, ConflictKind::Schema);
        assert_eq!(conflict.severity, Severity::Critical);
        assert!(!conflict.auto_resolvable);
        assert_eq!(conflict.recommended, "manual intervention required");
    }
    assert!(report.has_critical());
    assert!(report.conflict_summary.critical);

    let subtypes: Vec<&str> = report.conflicts.iter().map(|c| c.subtype.as_str()).collect();
    assert!(subtypes.contains(&"column_removed"));
    assert!(subtypes.contains(&"duplicate_table"));
}

/// Test: Mixed batch summary and ordering
/// Given outputs producing file, semantic, dependency and schema conflicts
/// When conflicts are detected
/// Then the summary counts each family and the list is sorted by severity
#[test]
fn test_mixed_batch_summary() {
    let outs = outputs(json!({
        "a": {
            "modified_files": ["app.py"],
            "api_contracts": {"GET /me": {"method": "GET", "response": {"id": "int"}}},
            "dependencies": {"orm": "1.4"},
            "schema_changes": [{"table": "sessions", "operation": "drop_table"}]
        },
        "b": {
            "modified_files": ["app.py"],
            "api_contracts": {"GET /me": {"method": "POST", "response": {"id": "int"}}},
            "dependencies": {"orm": "2.0"},
            "schema_changes": [{"table": "sessions", "operation": "add_column", "details": {"column": "ttl"}}]
        }
    }));
    let report = ConflictDetector::new().detect(&outs).unwrap();
    let summary = &report.conflict_summary;

    assert_eq!(summary.total, 4);
    for kind in ConflictKind::ALL {
        assert_eq!(summary.by_type.get(&kind), Some(&1), "{:?}", kind);
    }
    assert_eq!(summary.by_severity.get(&Severity::Critical), Some(&1));
    assert_eq!(summary.by_severity.get(&Severity::High), Some(&1));
    assert_eq!(summary.by_severity.get(&Severity::Medium), Some(&2));

    let severities: Vec<Severity> = report.conflicts.iter().map(|c| c.severity).collect();
    let mut sorted = severities.clone();
    sorted.sort_by(|a, b| b.cmp(a));
    assert_eq!(severities, sorted);
    assert_eq!(report.conflicts[0].kind, ConflictKind::Schema);
}

/// Test: Restricting detection to one family
/// Given the auth outputs plus a version mismatch
/// When only dependency conflicts are requested
/// Then the file conflict is not reported
#[test]
fn test_only_option_limits_checks() {
    let mut outs = auth_outputs();
    outs.get_mut(&id("login"))
        .unwrap()
        .dependencies
        .insert("jwt".into(), "1.0".into());
    outs.get_mut(&id("signup"))
        .unwrap()
        .dependencies
        .insert("jwt".into(), "2.0".into());

    let detector = ConflictDetector::with_options(DetectorOptions {
        only: Some(ConflictKind::Dependency),
        ..Default::default()
    });
    let report = detector.detect(&outs).unwrap();

    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].kind, ConflictKind::Dependency);
}

/// Test: Reports survive a JSON round trip for the coordinator
/// Given a detected report serialized to JSON
/// When it is parsed back
/// Then the parsed report equals the original
#[test]
fn test_report_reads_back_from_json() {
    let report = ConflictDetector::new().detect(&auth_outputs()).unwrap();
    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"type\":\"file_conflict\""));

    let parsed: ConflictReport = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, report);
}

/// Test: Detection is deterministic
/// Given the same outputs detected twice
/// When both reports are serialized
/// Then the bytes are identical
#[test]
fn test_detection_is_byte_identical() {
    let outs = auth_outputs();
    let first = serde_json::to_vec(&ConflictDetector::new().detect(&outs).unwrap()).unwrap();
    let second = serde_json::to_vec(&ConflictDetector::new().detect(&outs).unwrap()).unwrap();
    assert_eq!(first, second);
}

/// Test: Escaping paths are rejected
/// Given an output modifying ../outside.txt
/// When conflicts are detected
/// Then validation fails before any check runs
#[test]
fn test_escaping_path_is_rejected() {
    let outs = outputs(json!({"a": {"modified_files": ["../outside.txt"]}}));
    assert!(ConflictDetector::new().detect(&outs).is_err());
}
