use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("garden-node").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("garden-node 0.1.0"));
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("garden-node").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Secure mesh transport and command protocol for garden sensor nodes",
        ));
}

#[test]
fn test_cli_encrypt_missing_key() {
    let mut cmd = Command::cargo_bin("garden-node").unwrap();
    cmd.args(["encrypt", "--command", "{}"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "required arguments were not provided",
        ));
}

#[test]
fn test_cli_encrypt_broadcast() {
    let mut cmd = Command::cargo_bin("garden-node").unwrap();
    cmd.args([
        "encrypt",
        "--key",
        "garden",
        "--command",
        "{\"Command\":\"ping\"}",
        "--broadcast",
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("\"Command\":\"Publish\""))
    // "dst-FFFFFFFFFFFF" as hex
    .stdout(predicate::str::contains(
        "\"Payload\":\"h6473742d464646464646464646464646",
    ));
}

#[test]
fn test_cli_encrypt_rejects_bad_destination() {
    let mut cmd = Command::cargo_bin("garden-node").unwrap();
    cmd.args([
        "encrypt",
        "--key",
        "garden",
        "--command",
        "{}",
        "--destination",
        "not-a-node",
    ])
    .assert()
    .failure()
    .stderr(predicate::str::contains("Invalid destination"));
}

#[test]
fn test_cli_inspect_rejects_short_packet() {
    let mut cmd = Command::cargo_bin("garden-node").unwrap();
    cmd.args(["inspect", "--key", "garden", "--packet", "00010203"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rejected: packet length 4"));
}

#[test]
fn test_cli_run_setup_until_input_closes() {
    let store = tempfile::TempDir::new().unwrap();

    let mut cmd = Command::cargo_bin("garden-node").unwrap();
    cmd.args(["run", "--config", "missing.toml", "--store"])
        .arg(store.path())
        .env("GARDEN_LOG_LEVEL", "info")
        .env_remove("RUST_LOG")
        .write_stdin("{\"MeshKey\":\"garden\",\"MeshChannel\":6}\n")
        .assert()
        .success()
        .stderr(predicate::str::contains("entering setup mode"));

    assert_eq!(
        std::fs::read_to_string(store.path().join("meshChannel")).unwrap(),
        "6"
    );
}
