//! End-to-end tests for the `keel` binary that need no privileges.
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn keel(root: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("keel").unwrap();
    cmd.env("KEEL_ROOT", root.path()).env_remove("RUST_LOG");
    cmd
}

#[test]
fn run_without_command_fails() {
    let root = TempDir::new().unwrap();
    keel(&root)
        .args(["run", "-d"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing container command"));
}

#[test]
fn run_interactive_and_detached_fails() {
    let root = TempDir::new().unwrap();
    keel(&root)
        .args(["run", "-i", "-d", "sh"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot both be set"));
}

#[test]
fn stop_unknown_container_logs_and_succeeds() {
    let root = TempDir::new().unwrap();
    keel(&root)
        .args(["stop", "ghost"])
        .assert()
        .success()
        .stderr(predicate::str::contains("ghost"));
}

#[test]
fn ps_on_empty_root_prints_header() {
    let root = TempDir::new().unwrap();
    keel(&root)
        .arg("ps")
        .assert()
        .success()
        .stdout(predicate::str::contains("NAME").and(predicate::str::contains("STATUS")));
}

#[test]
fn network_list_on_empty_root() {
    let root = TempDir::new().unwrap();
    keel(&root)
        .args(["network", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("IP RANGE"));
}

#[test]
fn json_logs() {
    let root = TempDir::new().unwrap();
    keel(&root)
        .args(["--log-format", "json", "logs", "ghost"])
        .assert()
        .success()
        .stderr(predicate::str::contains("\"level\":\"ERROR\""));
}

#[test]
fn init_is_hidden() {
    let root = TempDir::new().unwrap();
    keel(&root)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("network").and(predicate::str::contains(" init ").not()));
}
