//! CLI integration tests for mssql-archiver.
//!
//! Everything here runs without a SQL Server: the memory and file job
//! stores never open a connection.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use std::path::Path;

fn cmd() -> Command {
    Command::cargo_bin("mssql-archiver").unwrap()
}

const CONNECTIONS: &str = r#"
connections:
  live:
    host: sql01
    database: Sales
    user: archiver
    password: hunter2
  archive:
    host: sql02
    database: SalesArchive
    user: archiver
    password: hunter2
"#;

const JOBS: &str = r#"
jobs:
  - name: orders-archive
    source_connection: live
    target_connection: archive
    source_table: Orders
    target_schema: archive
    target_table: Orders
    filter_column: CreatedAt
    filter_predicate: "< now - 90d"
    method: streaming_bulk_copy
    delete_after_copy: true
    batch_size: 1000
    max_rows_per_execution: 10000
    interval_minutes: 15
"#;

fn write_config(dir: &Path, store: &str, with_jobs: bool) -> std::path::PathBuf {
    let path = dir.join("archiver.yaml");
    let mut content = String::from(CONNECTIONS);
    content.push_str(store);
    if with_jobs {
        content.push_str(JOBS);
    }
    std::fs::write(&path, content).unwrap();
    path
}

fn memory_config(dir: &Path) -> std::path::PathBuf {
    write_config(dir, "store:\n  backend: memory\n", true)
}

fn file_config(dir: &Path, with_jobs: bool) -> std::path::PathBuf {
    let store = format!(
        "store:\n  backend: file\n  path: {}\n",
        dir.join("jobs.json").display()
    );
    write_config(dir, &store, with_jobs)
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("run-due"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("create-target"))
        .stdout(predicate::str::contains("inspect"))
        .stdout(predicate::str::contains("jobs"))
        .stdout(predicate::str::contains("recover"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_global_flags() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("archiver.yaml"));
}

#[test]
fn test_jobs_subcommand_help() {
    cmd()
        .args(["jobs", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("import"))
        .stdout(predicate::str::contains("enable"))
        .stdout(predicate::str::contains("disable"))
        .stdout(predicate::str::contains("reset"));
}

#[test]
fn test_inspect_requires_table() {
    cmd()
        .args(["inspect", "--connection", "live"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--table"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mssql-archiver"));
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

// =============================================================================
// Configuration Error Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_1() {
    cmd()
        .args(["--config", "/nonexistent/archiver.yaml", "jobs", "list"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("IO error"));
}

#[test]
fn test_invalid_yaml_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "connections: [unclosed").unwrap();
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "jobs", "list"])
        .assert()
        .code(2);
}

#[test]
fn test_no_connections_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "connections: {{}}").unwrap();
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "jobs", "list"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("at least one connection"));
}

#[test]
fn test_invalid_job_definition_exits_with_code_2() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("archiver.yaml");
    let content = format!(
        "{}store:\n  backend: memory\n{}",
        CONNECTIONS,
        JOBS.replace("max_rows_per_execution: 10000", "max_rows_per_execution: 10")
    );
    std::fs::write(&path, content).unwrap();

    cmd()
        .args(["--config", path.to_str().unwrap(), "jobs", "list"])
        .assert()
        .code(2);
}

#[test]
fn test_unknown_verbosity_exits_with_code_2() {
    let dir = tempfile::tempdir().unwrap();
    let path = memory_config(dir.path());
    cmd()
        .args(["--config", path.to_str().unwrap(), "--verbosity", "loud", "jobs", "list"])
        .assert()
        .code(2);
}

// =============================================================================
// Job Store Tests
// =============================================================================

#[test]
fn test_memory_store_lists_config_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let path = memory_config(dir.path());
    cmd()
        .args(["--config", path.to_str().unwrap(), "jobs", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("orders-archive"))
        .stdout(predicate::str::contains("streaming_bulk_copy"))
        .stdout(predicate::str::contains("not_started"));
}

#[test]
fn test_jobs_list_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = memory_config(dir.path());
    let output = cmd()
        .args(["--config", path.to_str().unwrap(), "--output-json", "jobs", "list"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let jobs: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let jobs = jobs.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["definition"]["name"], "orders-archive");
    assert_eq!(jobs[0]["runtime"]["is_enabled"], true);
}

#[test]
fn test_file_store_import_then_disable() {
    let dir = tempfile::tempdir().unwrap();
    let path = file_config(dir.path(), true);
    let config = path.to_str().unwrap();

    cmd()
        .args(["--config", config, "jobs", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No jobs"));

    cmd()
        .args(["--config", config, "jobs", "import"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 created"));

    // second import is a no-op
    cmd()
        .args(["--config", config, "jobs", "import"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 created, 0 updated, 1 unchanged"));

    cmd()
        .args(["--config", config, "jobs", "disable", "orders-archive"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Disabled orders-archive"));

    cmd()
        .args(["--config", config, "--output-json", "jobs", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"is_enabled\": false"));

    assert!(dir.path().join("jobs.json").exists());
}

#[test]
fn test_import_from_file_rejects_unknown_connection() {
    let dir = tempfile::tempdir().unwrap();
    let path = file_config(dir.path(), false);
    let jobs_file = dir.path().join("more-jobs.yaml");
    std::fs::write(
        &jobs_file,
        JOBS.trim_start()
            .trim_start_matches("jobs:\n")
            .replace("target_connection: archive", "target_connection: warehouse"),
    )
    .unwrap();

    cmd()
        .args([
            "--config",
            path.to_str().unwrap(),
            "jobs",
            "import",
            "--file",
            jobs_file.to_str().unwrap(),
        ])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("warehouse"));
}

#[test]
fn test_run_unknown_job_exits_with_code_3() {
    let dir = tempfile::tempdir().unwrap();
    let path = memory_config(dir.path());
    cmd()
        .args(["--config", path.to_str().unwrap(), "run", "no-such-job"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Job not found"));
}

#[test]
fn test_enable_unknown_job_exits_with_code_3() {
    let dir = tempfile::tempdir().unwrap();
    let path = file_config(dir.path(), false);
    cmd()
        .args(["--config", path.to_str().unwrap(), "jobs", "enable", "ghost"])
        .assert()
        .code(3);
}

#[test]
fn test_recover_with_nothing_interrupted() {
    let dir = tempfile::tempdir().unwrap();
    let path = memory_config(dir.path());
    cmd()
        .args(["--config", path.to_str().unwrap(), "recover"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No interrupted runs found"));
}
