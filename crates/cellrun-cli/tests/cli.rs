//! Integration tests for the cellrun CLI.
//!
//! These use in-process thread units so they do not depend on the worker
//! binary having been built.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn cellrun() -> Command {
    let mut cmd = Command::cargo_bin("cellrun").unwrap();
    cmd.args(["--worker", "thread"]);
    for var in [
        "CELLRUN_INIT_TIMEOUT_MS",
        "CELLRUN_EXECUTION_TIMEOUT_MS",
        "CELLRUN_WATCHDOG_MS",
        "CELLRUN_FALLBACK_GRACE_MS",
        "CELLRUN_INTERRUPT_MODE",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_exec_prints_output() {
    cellrun()
        .args(["exec", "print hello\nprint world"])
        .assert()
        .success()
        .stdout("hello\nworld\n")
        .stderr(predicate::str::contains("Completed"));
}

#[test]
fn test_exec_error_exit_code() {
    cellrun()
        .args(["exec", "print before\nraise RuntimeError: nope"])
        .assert()
        .code(1)
        .stdout("before\n")
        .stderr(predicate::str::contains("RuntimeError: nope"));
}

#[test]
fn test_run_file() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("hello.cell");
    fs::write(&script, "# greeting\nset name cellrun\nprint hi from $name\n").unwrap();

    cellrun()
        .arg("run")
        .arg(&script)
        .assert()
        .success()
        .stdout("hi from cellrun\n");
}

#[test]
fn test_run_missing_file() {
    cellrun()
        .args(["run", "/nonexistent/script.cell"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}

#[test]
fn test_execution_timeout_from_env() {
    cellrun()
        .env("CELLRUN_EXECUTION_TIMEOUT_MS", "200")
        .args(["exec", "sleep 5000"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Execution timed out after 200 ms"));
}

#[test]
fn test_invalid_env_override() {
    cellrun()
        .env("CELLRUN_WATCHDOG_MS", "0")
        .args(["exec", "print x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("watchdog_ms must be greater than zero"));
}

#[test]
fn test_config_file() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.json");
    fs::write(&config, r#"{"watchdog_ms": 4000, "interrupt_mode": "message"}"#).unwrap();

    let output = cellrun()
        .arg("--config")
        .arg(&config)
        .args(["check", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["config"]["watchdog_ms"], 4000);
    assert_eq!(report["config"]["fallback_grace_ms"], 250);
    assert_eq!(report["strategy"], "message");
    assert_eq!(report["worker"], "in-process thread");
}

#[test]
fn test_malformed_config_file() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.json");
    fs::write(&config, "{ not json").unwrap();

    cellrun()
        .arg("--config")
        .arg(&config)
        .args(["exec", "print x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"));
}

#[test]
fn test_check_reports_strategy() {
    cellrun()
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("shared memory"))
        .stdout(predicate::str::contains("Unit ready"));
}

#[test]
fn test_missing_worker_binary() {
    Command::cargo_bin("cellrun")
        .unwrap()
        .args(["--worker", "process", "--worker-path", "/nonexistent/cellrun-worker"])
        .args(["exec", "print x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("initialization failed"));
}
