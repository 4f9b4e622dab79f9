//! CLI tests for winrm-exec
//!
//! Covers the process contract: one JSON line on stdout, exit 0 whenever a
//! report was produced, exit 1 only for argument errors.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

fn winrm_exec_cmd() -> Command {
    Command::cargo_bin("winrm-exec").unwrap()
}

fn report(output: &std::process::Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().count(), 1, "expected one JSON line, got {:?}", stdout);
    serde_json::from_str(stdout.trim()).unwrap()
}

#[test]
fn test_help_exits_zero() {
    winrm_exec_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--transport"))
        .stdout(predicate::str::contains("--use-https"))
        .stdout(predicate::str::contains("--server-cert-validation"));
}

#[test]
fn test_version_exits_zero() {
    winrm_exec_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("winrm-exec"));
}

#[test]
fn test_no_arguments_prints_usage_report() {
    let output = winrm_exec_cmd().output().unwrap();
    assert_eq!(output.status.code(), Some(1));

    let json = report(&output);
    assert_eq!(json["success"], false);
    assert_eq!(json["stdout"], "");
    assert_eq!(json["exitCode"], 1);
    assert!(json["stderr"].as_str().unwrap().contains("Usage"));
}

#[test]
fn test_invalid_transport_is_usage_error() {
    let output = winrm_exec_cmd()
        .args(["winhost", "user", "pass", "hostname", "--transport", "ssh"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(report(&output)["success"], false);
}

#[test]
fn test_basic_over_http_is_insecure() {
    let output = winrm_exec_cmd()
        .args(["192.0.2.1", "user", "pass", "hostname", "--transport", "basic"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));

    let json = report(&output);
    assert_eq!(json["success"], false);
    assert_eq!(json["exitCode"], 1);
    assert!(json["stderr"]
        .as_str()
        .unwrap()
        .starts_with("InsecureAuthError"));
}

#[test]
fn test_out_of_range_port_is_config_error() {
    let output = winrm_exec_cmd()
        .args(["winhost", "user", "pass", "hostname", "--port", "70000"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));

    let json = report(&output);
    assert_eq!(json["success"], false);
    assert!(json["stderr"].as_str().unwrap().starts_with("ConfigError"));
}

#[test]
fn test_unreachable_host_still_reports() {
    let output = winrm_exec_cmd()
        .args(["127.0.0.1", "user", "pass", "hostname", "--port", "1"])
        .timeout(std::time::Duration::from_secs(60))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));

    let json = report(&output);
    assert_eq!(json["success"], false);
    assert_eq!(json["exitCode"], 1);
    assert!(!json["stderr"].as_str().unwrap().is_empty());
}

#[test]
fn test_huge_deadline_still_reports() {
    let output = winrm_exec_cmd()
        .args(["127.0.0.1", "user", "pass", "hostname", "--port", "1"])
        .args(["--timeout", "500000000000y"])
        .timeout(std::time::Duration::from_secs(60))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));

    let json = report(&output);
    assert_eq!(json["success"], false);
    assert_eq!(json["exitCode"], 1);
}

#[test]
fn test_unreachable_host_names_the_cause() {
    let output = winrm_exec_cmd()
        .args(["127.0.0.1", "user", "pass", "hostname", "--port", "1"])
        .timeout(std::time::Duration::from_secs(60))
        .output()
        .unwrap();

    let json = report(&output);
    let stderr = json["stderr"].as_str().unwrap();
    assert!(stderr.starts_with("AuthenticationError"));
    // the connection failure is part of the message, not only the source chain
    assert!(stderr.contains("TransportError"), "stderr: {}", stderr);
    assert!(stderr.to_lowercase().contains("refused"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_retry_multiplier_is_config_error() {
    let mut config = NamedTempFile::new().unwrap();
    writeln!(
        config,
        "[client.receive_retry]\nmultiplier = -1.0\nstrategy = \"exponential\""
    )
    .unwrap();

    let output = winrm_exec_cmd()
        .args(["winhost", "user", "pass", "hostname", "-c"])
        .arg(config.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));

    let json = report(&output);
    let stderr = json["stderr"].as_str().unwrap();
    assert!(stderr.starts_with("ConfigError"));
    assert!(stderr.contains("multiplier"));
}

#[test]
fn test_request_timeout_must_exceed_operation_timeout() {
    let mut config = NamedTempFile::new().unwrap();
    writeln!(config, "[client]\nrequest_timeout = \"10s\"").unwrap();

    let output = winrm_exec_cmd()
        .args(["winhost", "user", "pass", "hostname", "--operation-timeout", "20s"])
        .arg("--config")
        .arg(config.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));

    let json = report(&output);
    assert!(json["stderr"].as_str().unwrap().starts_with("ConfigError"));
}

#[test]
fn test_bad_config_file_is_config_error() {
    let mut config = NamedTempFile::new().unwrap();
    writeln!(config, "[client\nthis is not toml").unwrap();

    let output = winrm_exec_cmd()
        .args(["winhost", "user", "pass", "hostname", "-c"])
        .arg(config.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));

    let json = report(&output);
    assert!(json["stderr"].as_str().unwrap().starts_with("ConfigError"));
}

#[test]
fn test_logs_stay_off_stdout() {
    let output = winrm_exec_cmd()
        .args(["192.0.2.1", "user", "pass", "hostname", "--transport", "basic", "-vvv"])
        .output()
        .unwrap();

    // stdout is still exactly one JSON line
    report(&output);
}
