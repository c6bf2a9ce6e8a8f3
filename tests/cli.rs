//! CLI contract tests driving the compiled `agentflow` binary end to end.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_every_subcommand() {
    let mut cmd = Command::cargo_bin("agentflow").expect("binary should build");
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("migrate"));
}

#[test]
fn run_rejects_missing_pipeline_file() {
    let home = tempfile::tempdir().expect("tempdir");
    let mut cmd = Command::cargo_bin("agentflow").expect("binary should build");
    cmd.env("HOME", home.path());
    cmd.args(["run", "/nonexistent/pipeline.json"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("failed to read"));
}

#[test]
fn run_rejects_malformed_pipeline_json() {
    let home = tempfile::tempdir().expect("tempdir");
    let pipeline_path = home.path().join("pipeline.json");
    std::fs::write(&pipeline_path, "{ not json").expect("write fixture");

    let mut cmd = Command::cargo_bin("agentflow").expect("binary should build");
    cmd.env("HOME", home.path());
    cmd.args(["run", pipeline_path.to_str().expect("utf8 path")]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("failed to parse"));
}

#[test]
fn migrate_applies_schema_and_exits_cleanly() {
    let home = tempfile::tempdir().expect("tempdir");
    let mut cmd = Command::cargo_bin("agentflow").expect("binary should build");
    cmd.env("HOME", home.path());
    cmd.arg("migrate");
    cmd.assert().success();

    let db_path = home.path().join(".agentflow").join("agentflow.db");
    assert!(db_path.exists(), "migrate should create the sqlite database");
}
