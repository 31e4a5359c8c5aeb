//! Integration tests: run the provenant binary and check exit codes and output.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn provenant(root: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_provenant"));
    cmd.arg("--root")
        .arg(root)
        .env("PROVENANT_QUIET", "1")
        .env("NO_COLOR", "1")
        .env_remove("PROVENANT_HOME")
        .env("PROVENANT_WRITER_ID", "cli-test");
    cmd
}

fn run(root: &Path, args: &[&str]) -> Output {
    provenant(root).args(args).output().unwrap()
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).to_string()
}

fn json(out: &Output) -> serde_json::Value {
    serde_json::from_slice(&out.stdout).unwrap()
}

#[test]
fn test_help() {
    let out = Command::new(env!("CARGO_BIN_EXE_provenant")).arg("--help").output().unwrap();
    assert!(out.status.success(), "provenant --help should succeed");
    let text = stdout(&out);
    assert!(text.contains("store"));
    assert!(text.contains("verify"));
    assert!(text.contains("validate"));
}

#[test]
fn test_version() {
    let out = Command::new(env!("CARGO_BIN_EXE_provenant")).arg("--version").output().unwrap();
    assert!(out.status.success());
    assert!(stdout(&out).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_append_log_validate() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    for event in ["capsule_created", "archive_sealed", "validation_run"] {
        let out = run(root, &["append", event, "--payload", r#"{"by":"cli"}"#]);
        assert!(out.status.success(), "append {} failed", event);
    }

    let out = run(root, &["--json", "validate", "--from", "0", "--to", "2"]);
    assert!(out.status.success());
    let result = json(&out);
    assert_eq!(result["valid"], serde_json::json!(true));
    assert_eq!(result["checked"], serde_json::json!([0, 1, 2]));

    let out = run(root, &["--json", "log", "--limit", "2"]);
    assert!(out.status.success());
    let entries = json(&out);
    assert_eq!(entries.as_array().map(|a| a.len()), Some(2));
    assert_eq!(entries[1]["event_type"], serde_json::json!("validation_run"));
}

#[test]
fn test_unknown_event_type_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = run(dir.path(), &["append", "capsule_exploded"]);
    assert!(!out.status.success());
}

#[test]
fn test_store_and_verify_capsule() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("data");
    let primary = dir.path().join("primary.bin");
    let note = dir.path().join("note.txt");
    fs::write(&primary, b"hello").unwrap();
    fs::write(&note, b"hi").unwrap();

    let note_arg = format!("note.txt={}", note.display());
    let out = run(
        &root,
        &[
            "--json",
            "store",
            "CAP-1",
            "--primary",
            primary.to_str().unwrap(),
            "--file",
            &note_arg,
            "--metadata",
            r#"{"v":1}"#,
        ],
    );
    assert!(out.status.success(), "store failed: {}", String::from_utf8_lossy(&out.stderr));
    let receipt = json(&out);
    let archive_path = receipt["archive"]["archive_path"].as_str().unwrap().to_string();
    assert!(Path::new(&archive_path).is_file());

    let out = run(&root, &["--json", "verify", "CAP-1", "--record"]);
    assert!(out.status.success());
    let report = json(&out);
    assert_eq!(report["valid"], serde_json::json!(true));
    assert_eq!(report["merkle_root_matches"], serde_json::json!(true));

    let out = run(&root, &["--json", "verify", &archive_path]);
    assert!(out.status.success());

    let out = run(&root, &["--json", "proof", "CAP-1", "files/note.txt"]);
    assert!(out.status.success());
    assert_eq!(json(&out)["verified"], serde_json::json!(true));

    let out = run(&root, &["--json", "archives", "list"]);
    assert_eq!(json(&out).as_array().map(|a| a.len()), Some(1));

    let out = run(&root, &["--json", "blackboard", "show"]);
    assert!(out.status.success());
    assert!(json(&out)["entries"].get("reinject:CAP-1").is_some());
}

#[test]
fn test_verify_fails_for_tampered_ledger_root() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let primary = dir.path().join("primary.bin");
    fs::write(&primary, b"hello").unwrap();
    assert!(run(root, &["store", "CAP-1", "--primary", primary.to_str().unwrap()]).status.success());

    // rewrite the recorded merkle root; the chain and the capsule both stop verifying
    let ledger = root.join("ledger.jsonl");
    let content = fs::read_to_string(&ledger).unwrap();
    let entry: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
    let recorded = entry["payload"]["merkle_root"].as_str().unwrap().to_string();
    fs::write(&ledger, content.replacen(&recorded, &"0".repeat(64), 1)).unwrap();

    assert!(!run(root, &["verify", "CAP-1"]).status.success());
    assert!(!run(root, &["validate"]).status.success());
}

#[test]
fn test_cas_put_get_verify() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("data");
    let file = dir.path().join("blob.txt");
    fs::write(&file, b"hello").unwrap();

    let out = run(&root, &["--json", "cas", "put", file.to_str().unwrap()]);
    assert!(out.status.success());
    let put = json(&out);
    let digest = put["digest"].as_str().unwrap().to_string();
    assert_eq!(digest, "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824");
    assert_eq!(put["deduplicated"], serde_json::json!(false));

    let out = run(&root, &["--json", "cas", "put", file.to_str().unwrap()]);
    assert_eq!(json(&out)["deduplicated"], serde_json::json!(true));

    let out = run(&root, &["cas", "get", &digest]);
    assert!(out.status.success());
    assert_eq!(out.stdout, b"hello");

    assert!(run(&root, &["cas", "verify"]).status.success());
    assert!(!run(&root, &["cas", "get", &"ab".repeat(32)]).status.success());
}

#[test]
fn test_blackboard_merge_file() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("data");
    let snapshot = dir.path().join("remote.json");
    fs::write(
        &snapshot,
        r#"{"entries":{"reinject:CAP-9":{"register":null,"presence":{"added":[{"element":"pending","id":"remote:1:aa"}],"removed":[]}}}}"#,
    )
    .unwrap();

    let out = run(&root, &["--json", "blackboard", "merge", snapshot.to_str().unwrap()]);
    assert!(out.status.success(), "merge failed: {}", String::from_utf8_lossy(&out.stderr));
    assert!(json(&out)["entries"].get("reinject:CAP-9").is_some());

    let out = run(&root, &["--json", "blackboard", "clear", "CAP-9"]);
    assert_eq!(json(&out)["removed"], serde_json::json!(1));
}

#[test]
fn test_archives_sweep_on_empty_root() {
    let dir = tempfile::tempdir().unwrap();
    let out = run(dir.path(), &["--json", "archives", "sweep"]);
    assert!(out.status.success());
    assert_eq!(json(&out)["removed"], serde_json::json!(0));
}
