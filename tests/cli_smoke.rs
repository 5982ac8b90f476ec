//! Smoke tests for the `kiln` binary surface.

use assert_cmd::Command;
use predicates::prelude::*;

fn kiln() -> (Command, tempfile::TempDir) {
    let mut cmd = Command::cargo_bin("kiln").unwrap_or_else(|err| panic!("binary: {err}"));
    // Keep the merged configuration empty and deterministic.
    let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    cmd.current_dir(dir.path());
    cmd.env_clear();
    (cmd, dir)
}

#[test]
fn help_describes_the_tool() {
    let (mut cmd, _dir) = kiln();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Bake reusable machine images from temporary cloud instances",
        ));
}

#[test]
fn no_arguments_shows_usage_and_fails() {
    let (mut cmd, _dir) = kiln();
    cmd.assert().failure();
}

#[test]
fn build_without_configuration_fails_cleanly() {
    let (mut cmd, _dir) = kiln();
    cmd.arg("build")
        .assert()
        .failure()
        .stderr(predicate::str::is_empty().not());
}
