//! P8 (git argument-injection safety) and P10 (evidence snapshot
//! determinism): a task id or branch name starting with `-` is never
//! parsed as a flag, and two callers writing evidence into the same
//! fingerprint-keyed snapshot directory both land under the same path
//! with independently verifiable headers.

use edison::evidence::{CommandEvidence, EvidenceService, RepoFingerprintRecord};
use edison::git_safety::{run_git_with_separator, GitSafetyError, RepoFingerprint};
use tempfile::TempDir;

#[test]
fn a_dash_prefixed_identifier_never_reaches_git_as_a_flag() {
    let tmp = TempDir::new().unwrap();
    let err = run_git_with_separator(tmp.path(), &["branch"], &["--evil-flag-looking-id"]).unwrap_err();

    match err {
        GitSafetyError::GitCommand { command, stderr, .. } => {
            assert!(command.contains(" -- --evil-flag-looking-id"));
            assert!(!stderr.to_lowercase().contains("unknown option"));
        }
        other => panic!("expected a GitCommand failure, got {other:?}"),
    }
}

#[test]
fn two_snapshots_at_the_same_fingerprint_share_one_directory() {
    let tmp = TempDir::new().unwrap();
    let service = EvidenceService::new(tmp.path());
    let fingerprint = RepoFingerprint {
        head: "cafef00d".to_owned(),
        index_sha256: "0ddba11".to_owned(),
        dirty: false,
    };

    let first_caller = service.snapshot_dir(&fingerprint);
    let second_caller = service.snapshot_dir(&fingerprint);
    assert_eq!(first_caller, second_caller);
    assert!(first_caller.ends_with("cafef00d/0ddba11/clean"));

    let record: RepoFingerprintRecord = (&fingerprint).into();
    let lint_evidence = CommandEvidence {
        task_id: "T1".to_owned(),
        round: 1,
        command_name: "lint".to_owned(),
        command: "cargo clippy".to_owned(),
        cwd: "/repo".to_owned(),
        exit_code: 0,
        output: "ok\n".to_owned(),
        fingerprint: record.clone(),
    };
    let test_evidence = CommandEvidence {
        task_id: "T1".to_owned(),
        round: 1,
        command_name: "test".to_owned(),
        command: "cargo test".to_owned(),
        cwd: "/repo".to_owned(),
        exit_code: 0,
        output: "passed\n".to_owned(),
        fingerprint: record,
    };

    std::fs::create_dir_all(&first_caller).unwrap();
    let lint_path = first_caller.join("command-lint.txt");
    let test_path = first_caller.join("command-test.txt");
    service.write_command_evidence(&lint_path, &lint_evidence, Some(b"session-key")).unwrap();
    service.write_command_evidence(&test_path, &test_evidence, Some(b"session-key")).unwrap();

    assert!(edison::evidence::verify_command_evidence_hmac(&lint_path, b"session-key"));
    assert!(edison::evidence::verify_command_evidence_hmac(&test_path, b"session-key"));

    let lint_content = std::fs::read_to_string(&lint_path).unwrap();
    let test_content = std::fs::read_to_string(&test_path).unwrap();
    assert!(lint_content.contains("fingerprint: cafef00d|0ddba11|clean"));
    assert!(test_content.contains("fingerprint: cafef00d|0ddba11|clean"));
}
