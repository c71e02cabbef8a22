//! End-to-end tests for the ferry binary.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn ferry() -> Command {
    let mut command = Command::cargo_bin("ferry").expect("Failed to find ferry binary");
    command.env_remove("FERRY_ACTION_TIMEOUT_MS");
    command.env_remove("FERRY_SPAWN_TIMEOUT_MS");
    command
}

/// A temporary root directory populated with fy files.
fn project(files: &[(&str, &str)]) -> TempDir {
    let temp = TempDir::new().expect("Failed to create temp directory");
    for (name, source) in files {
        fs::write(temp.path().join(name), source).expect("Failed to write file");
    }
    temp
}

#[test]
fn test_eval_prints_completion_value() {
    ferry()
        .args(["eval", "1 + 1"])
        .assert()
        .success()
        .stdout("2\n");

    ferry()
        .args(["eval", "let n: Int = 2; n * 21"])
        .assert()
        .success()
        .stdout("42\n");
}

#[test]
fn test_eval_passes_arguments() {
    ferry()
        .args(["eval", "print(len(argv)); argv[1]", "first", "second"])
        .assert()
        .success()
        .stdout("2\nsecond\n");
}

#[test]
fn test_eval_error_fails() {
    ferry()
        .args(["eval", "throw \"nope\""])
        .assert()
        .failure()
        .stderr(predicate::str::contains("evaluation error").and(predicate::str::contains("nope")));
}

#[test]
fn test_run_module_with_imports() {
    let root = project(&[
        ("lib.fy", "export let x = 42"),
        ("main.fy", "import { x } from \"lib\"\nprint(x * 2)\nprint(argv[0])"),
    ]);

    ferry()
        .arg("run")
        .arg(root.path().join("main.fy"))
        .arg("extra")
        .assert()
        .success()
        .stdout("84\nextra\n");
}

#[test]
fn test_run_missing_module_fails() {
    ferry()
        .args(["run", "/nonexistent/main.fy"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read module"));
}

#[test]
fn test_load_and_import_from_root() {
    let root = project(&[
        ("setup.fy", "print(\"setup ran\")"),
        ("side.fy", "print(\"side effect\")"),
    ]);

    ferry()
        .arg("--root")
        .arg(root.path())
        .args(["load", "setup"])
        .assert()
        .success()
        .stdout("setup ran\n");

    ferry()
        .arg("--root")
        .arg(root.path())
        .args(["import", "side"])
        .assert()
        .success()
        .stdout("side effect\n");
}

#[test]
fn test_unresolvable_import_shows_hint() {
    let root = project(&[]);

    ferry()
        .arg("--root")
        .arg(root.path())
        .args(["import", "missing"])
        .assert()
        .failure()
        .stderr(
            predicate::str::contains("cannot resolve 'missing'")
                .and(predicate::str::contains("check the loader root")),
        );
}

#[test]
fn test_workers_run_in_parallel_contexts() {
    ferry()
        .args(["workers", "-n", "3", "init.index * 10"])
        .assert()
        .success()
        .stdout("worker:1: 0\nworker:2: 10\nworker:3: 20\n");
}

#[test]
fn test_invalid_config_is_rejected() {
    let root = project(&[("ferry.json", "{\"spawn_timeout_ms\": 0}")]);

    ferry()
        .arg("--config")
        .arg(root.path().join("ferry.json"))
        .args(["eval", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("spawn_timeout_ms must be positive"));
}
