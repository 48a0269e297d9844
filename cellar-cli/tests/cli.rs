use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn unknown_subcommand_is_rejected_by_clap() {
    let mut cmd = Command::cargo_bin("cellar").unwrap();
    cmd.arg("frobnicate");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn get_without_a_name_is_rejected_by_clap() {
    let mut cmd = Command::cargo_bin("cellar").unwrap();
    cmd.arg("get");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn put_against_an_unreachable_server_exits_non_zero() {
    let mut cmd = Command::cargo_bin("cellar").unwrap();
    cmd.args(["-c", "/nonexistent-cellar-cli-config.yaml", "put", "a"])
        .write_stdin("a secret value");
    cmd.assert().failure();
}
