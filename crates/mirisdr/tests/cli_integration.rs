//! Integration tests for the `mirisdr` binary.
//!
//! Only commands that need no receiver attached are run for real; the rest
//! are checked through `--help`.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn cli() -> assert_cmd::Command {
    cargo_bin_cmd!("mirisdr")
}

#[test]
fn cli_help_succeeds() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("mirisdr"));
}

#[test]
fn cli_version_prints_version() {
    cli()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

// ── config ──

#[test]
fn cli_config_json_produces_valid_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    let output = cli()
        .args(["--json", "--config"])
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let json: serde_json::Value =
        serde_json::from_slice(&output).expect("config --json should produce valid JSON");
    assert!(json["settings"].is_object());
    assert_eq!(json["config_file_exists"], false);
    assert_eq!(json["settings"]["center_frequency"], 100_000_000);
    assert!(json["problems"].as_array().unwrap().is_empty());
}

#[test]
fn cli_config_reads_custom_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "center_frequency = 433920000\nbuffer_count = 8\n").unwrap();

    cli()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("(loaded)"))
        .stdout(predicate::str::contains("433920000"))
        .stdout(predicate::str::contains("Problems:").not());
}

#[test]
fn cli_config_reports_validation_problems() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "buffer_length = 1000\n").unwrap();

    cli()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("Problems:"))
        .stdout(predicate::str::contains("not a multiple of 512"));
}

#[test]
fn cli_config_invalid_toml_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "this is { not toml").unwrap();

    cli()
        .args(["--json", "--config"])
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"buffer_count\": 32"))
        .stderr(predicate::str::contains("config parse error"));
}

// ── --verbose flag ──

#[test]
fn cli_verbose_flag_accepted() {
    cli().args(["-v", "plan", "--freq", "100000000"]).assert().success();
}

#[test]
fn cli_verbose_long_flag_accepted() {
    cli()
        .args(["--verbose", "plan", "--freq", "100000000"])
        .assert()
        .success();
}

// ── plan ──

#[test]
fn cli_plan_prints_registers() {
    cli()
        .args(["plan", "--freq", "100000000"])
        .assert()
        .success()
        .stdout(predicate::str::contains("VHF_MODE"))
        .stdout(predicate::str::contains("0x05f420"))
        .stdout(predicate::str::contains("0x210012"));
}

#[test]
fn cli_plan_json_lists_write_order() {
    let output = cli()
        .args(["--json", "plan", "--freq", "1000000000"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(json["mode"], "BL_MODE");
    let regs: Vec<u64> = json["registers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["reg"].as_u64().unwrap())
        .collect();
    assert_eq!(regs, vec![0, 5, 2, 1]);
    assert_eq!(json["registers"][2]["value"], "0x140282");
}

#[test]
fn cli_plan_am_band_fails() {
    cli()
        .args(["plan", "--freq", "7100000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"))
        .stderr(predicate::str::contains("AM_MODE1"));
}

#[test]
fn cli_plan_requires_freq() {
    cli().arg("plan").assert().failure();
}

// ── Device commands ──

#[test]
fn cli_devices_succeeds() {
    cli().arg("devices").assert().success();
}

#[test]
fn cli_devices_json_has_count() {
    let output = cli()
        .args(["--json", "devices"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert!(json["count"].is_u64());
    assert!(json["devices"].is_array());
}

#[test]
fn cli_info_help_succeeds() {
    cli()
        .args(["info", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--index"));
}

#[test]
fn cli_rx_help_succeeds() {
    cli()
        .args(["rx", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--samples"))
        .stdout(predicate::str::contains("--buffers"));
}

#[test]
fn cli_rx_rejects_am_frequency_before_opening() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    cli()
        .arg("--config")
        .arg(&path)
        .args(["rx", "--freq", "1000000", "-"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Config error"));
}
