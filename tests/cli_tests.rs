mod common;

use common::*;
use std::process::Command;

fn cli_command() -> Command {
    Command::new(env!("CARGO_BIN_EXE_station-flow"))
}

#[test]
fn test_cli_help() {
    let output = cli_command().arg("--help").output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Run resumable hardware test station sequences"));
    assert!(stdout.contains("run"));
    assert!(stdout.contains("validate"));
    assert!(stdout.contains("status"));
    assert!(stdout.contains("reset"));
}

#[test]
fn test_cli_version() {
    let output = cli_command().arg("--version").output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("station-flow"));
}

#[test]
fn test_cli_run_help() {
    let output = cli_command().args(["run", "--help"]).output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Run (or resume) the station sequence"));
    assert!(stdout.contains("--sn"));
    assert!(stdout.contains("--debug"));
    assert!(stdout.contains("--reset"));
}

#[test]
fn test_cli_run_requires_sn() {
    let dir = create_test_dir();
    let path = write_station(dir.path(), SIMPLE_STATION);

    let output = cli_command()
        .args(["run", path.to_str().unwrap()])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_cli_validate_ok() {
    let dir = create_test_dir();
    let path = write_station(dir.path(), SIMPLE_STATION);

    let output = cli_command()
        .args(["validate", path.to_str().unwrap()])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("is valid (2 steps)"));
}

#[test]
fn test_cli_validate_malformed_rule() {
    let dir = create_test_dir();
    let path = write_station(
        dir.path(),
        r#"
steps:
  - order: 10
    name: Power
    cmd: "true"
    pass_by: "bogus_rule:1"
"#,
    );

    let output = cli_command()
        .args(["validate", path.to_str().unwrap()])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("10_Power"));
    assert!(stdout.contains("bogus_rule:1"));
}

#[test]
fn test_cli_nonexistent_station() {
    let output = cli_command()
        .args(["validate", "/nonexistent/station.yaml"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not found") || stderr.contains("Error"));
}

#[test]
fn test_cli_status_without_runs() {
    let dir = create_test_dir();
    let path = write_station(dir.path(), SIMPLE_STATION);

    let output = cli_command()
        .args(["status", path.to_str().unwrap(), "--sn", "SN001"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("No runs recorded for SN001"));
}

#[cfg(unix)]
#[test]
fn test_cli_run_pass_then_status_and_reset() {
    let dir = create_test_dir();
    let path = write_station(dir.path(), SIMPLE_STATION);
    let config = path.to_str().unwrap();

    let output = cli_command()
        .args(["run", config, "--sn", "SN001"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("POWER_OK"));
    assert!(stdout.contains("flashed SN001"));
    assert!(stdout.contains("Status: Pass"));
    assert!(stdout.contains("Pointer: finished_pass"));

    let output = cli_command()
        .args(["status", config, "--sn", "SN001"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Status: finished_pass"));
    assert!(stdout.contains("10_Power"));
    assert!(stdout.contains("PASS"));

    let output = cli_command()
        .args(["reset", config, "--sn", "SN001"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(pointer(dir.path(), "SN001")["status"], "running");
}

#[cfg(unix)]
#[test]
fn test_cli_run_failure_exit_code() {
    let dir = create_test_dir();
    let path = write_station(dir.path(), FAILING_STATION);

    let output = cli_command()
        .args(["run", path.to_str().unwrap(), "--sn", "SN002"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Status: Fail"));
    assert!(stdout.contains("Report:"));
}

#[test]
fn test_cli_reset_without_runs() {
    let dir = create_test_dir();
    let path = write_station(dir.path(), SIMPLE_STATION);

    let output = cli_command()
        .args(["reset", path.to_str().unwrap(), "--sn", "SN001"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
}
