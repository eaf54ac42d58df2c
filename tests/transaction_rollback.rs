//! Scenario 3 (spec §8): a validation transaction that aborts leaves no
//! trace in the real tree and records the abort in the session log.

use std::fs;

use edison::transaction::{recover_incomplete_validation_transactions, validation_transaction};
use tempfile::TempDir;

#[test]
fn aborted_transaction_leaves_no_artifacts_in_the_target_root() {
    let tmp = TempDir::new().unwrap();
    let sessions_root = tmp.path().join("sessions");
    let target_root = tmp.path().join("project");

    let tx = validation_transaction(&sessions_root, &target_root, "s1", Some(0)).unwrap();
    let staged_dir = tx
        .staging_root()
        .join("qa/validation-evidence/T1/round-1");
    fs::create_dir_all(&staged_dir).unwrap();
    fs::write(staged_dir.join("validator-sec-report.json"), "{}").unwrap();

    tx.abort("validator failed").unwrap();

    assert!(!target_root
        .join("qa/validation-evidence/T1/round-1/validator-sec-report.json")
        .exists());

    let log = fs::read_to_string(sessions_root.join("s1/validation-transactions.log")).unwrap();
    let last_line = log.lines().last().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(last_line).unwrap();
    assert_eq!(parsed["status"], "abort");
}

#[test]
fn committed_transaction_is_visible_at_the_real_path() {
    let tmp = TempDir::new().unwrap();
    let sessions_root = tmp.path().join("sessions");
    let target_root = tmp.path().join("project");

    let tx = validation_transaction(&sessions_root, &target_root, "s2", Some(0)).unwrap();
    let staged_dir = tx
        .staging_root()
        .join("qa/validation-evidence/T1/round-1");
    fs::create_dir_all(&staged_dir).unwrap();
    fs::write(staged_dir.join("implementation-report.json"), "{}").unwrap();
    tx.commit().unwrap();

    assert!(target_root
        .join("qa/validation-evidence/T1/round-1/implementation-report.json")
        .exists());
}

#[test]
fn crash_recovery_sweeps_orphaned_staging_directories_idempotently() {
    let tmp = TempDir::new().unwrap();
    let sessions_root = tmp.path().join("sessions");
    let orphan = sessions_root.join("s3/.tx/left-behind");
    fs::create_dir_all(&orphan).unwrap();
    fs::write(orphan.join("partial.json"), "{}").unwrap();

    let recovered = recover_incomplete_validation_transactions(&sessions_root, "s3").unwrap();
    assert_eq!(recovered, 1);
    assert!(!orphan.exists());

    let second_pass = recover_incomplete_validation_transactions(&sessions_root, "s3").unwrap();
    assert_eq!(second_pass, 0);
}
