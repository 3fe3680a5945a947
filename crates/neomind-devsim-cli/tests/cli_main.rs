//! Basic CLI tests for the neomind-devsim command-line interface.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("neomind-devsim").unwrap();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("NeoMind Device Simulator"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("validate"));
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("neomind-devsim").unwrap();
    cmd.arg("--version");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("neomind-devsim"));
}

#[test]
fn test_validate_device_list() {
    let mut devices = tempfile::NamedTempFile::new().unwrap();
    write!(
        devices,
        r#"[{{"_id": "d1", "configuration": {{"_kind": "hub", "connectionString": "HostName=h.net;DeviceId=d1;SharedAccessKey=c2VjcmV0"}}, "comms": []}}]"#
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("neomind-devsim").unwrap();
    cmd.arg("validate").arg(devices.path());

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Devices: 1"))
        .stdout(predicate::str::contains("d1"));
}

#[test]
fn test_validate_rejects_bad_config() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    write!(config, "[simulation]\nrestart = {{ min = 5, max = 1 }}\n").unwrap();
    let devices = tempfile::NamedTempFile::new().unwrap();

    let mut cmd = Command::cargo_bin("neomind-devsim").unwrap();
    cmd.arg("--config").arg(config.path()).arg("validate").arg(devices.path());

    cmd.assert().failure();
}
