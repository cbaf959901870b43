//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn help_lists_lifecycle_subcommands() {
    let mut cmd = cargo_bin_cmd!("cirrus");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("create"))
        .stdout(predicate::str::contains("destroy"))
        .stdout(predicate::str::contains("term-protect"));
}

#[test]
fn missing_subcommand_prints_usage() {
    let mut cmd = cargo_bin_cmd!("cirrus");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn set_tags_requires_a_tag() {
    let mut cmd = cargo_bin_cmd!("cirrus");
    cmd.args(["set-tags", "web-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("KEY=VALUE"));
}
