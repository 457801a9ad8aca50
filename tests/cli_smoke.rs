//! End-to-end smoke tests for the `skiff` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn skiff() -> Command {
    Command::cargo_bin("skiff").unwrap_or_else(|err| panic!("binary: {err}"))
}

#[test]
fn no_arguments_prints_usage_and_fails() {
    skiff()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn help_mentions_the_subcommands() {
    skiff()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("listen"));
}

#[test]
fn init_writes_a_config_and_respects_force() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));

    skiff().current_dir(tmp.path()).arg("init").assert().success();
    assert!(tmp.path().join("skiff.yml").exists());

    skiff()
        .current_dir(tmp.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));

    skiff()
        .current_dir(tmp.path())
        .args(["init", "--force"])
        .assert()
        .success();
}

#[test]
fn dry_run_prints_the_composed_script_without_executing() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    skiff().current_dir(tmp.path()).arg("init").assert().success();

    skiff()
        .current_dir(tmp.path())
        .args(["run", "--dry", "--", "echo", "hello"])
        .assert()
        .success()
        .stdout(predicate::str::contains("#!/bin/bash"))
        .stdout(predicate::str::contains("truncate -s 0 /tmp/skiff/launch.log"))
        .stdout(predicate::str::contains("echo hello"));
}

#[test]
fn run_fails_without_a_usable_configuration() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    // An unknown mode fails even if an ancestor of the temp dir happens
    // to carry a config file, so this stays hermetic.
    skiff()
        .current_dir(tmp.path())
        .args(["run", "--mode", "nope", "--", "true"])
        .assert()
        .failure();
}
