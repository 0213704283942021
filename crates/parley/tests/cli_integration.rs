//! CLI integration tests for the Parley command-line interface.
//!
//! These tests do not require a running server; they cover argument
//! parsing, help output and the offline config commands.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a command for the parley binary with an isolated config directory.
fn parley(config_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("parley").unwrap();
    cmd.env("PARLEY_CONFIG_DIR", config_dir.path());
    cmd.current_dir(config_dir.path());
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    parley(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("stats"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_version_displays() {
    let dir = TempDir::new().unwrap();
    parley(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("parley"));
}

#[test]
fn test_start_help_shows_overrides() {
    let dir = TempDir::new().unwrap();
    parley(&dir)
        .args(["start", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--port"))
        .stdout(predicate::str::contains("--bind"))
        .stdout(predicate::str::contains("--redis-url"));
}

#[test]
fn test_unknown_subcommand_fails() {
    let dir = TempDir::new().unwrap();
    parley(&dir).arg("frobnicate").assert().failure();
}

#[test]
fn test_config_shows_defaults() {
    let dir = TempDir::new().unwrap();
    parley(&dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[server]"))
        .stdout(predicate::str::contains("port = 8080"))
        .stdout(predicate::str::contains("backend = \"memory\""));
}

#[test]
fn test_config_reads_project_file() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("parley.toml"), "[server]\nport = 9123\n").unwrap();

    parley(&dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("port = 9123"));
}

#[test]
fn test_config_init_local() {
    let dir = TempDir::new().unwrap();
    parley(&dir)
        .args(["config", "init", "--local"])
        .assert()
        .success();
    assert!(dir.path().join("parley.toml").is_file());

    parley(&dir)
        .args(["config", "init", "--local"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_stats_without_server_fails() {
    let dir = TempDir::new().unwrap();
    parley(&dir)
        .args(["stats", "--server", "http://127.0.0.1:1"])
        .assert()
        .failure();
}
