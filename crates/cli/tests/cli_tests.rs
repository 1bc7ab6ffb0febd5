//! CLI integration tests

use std::process::{Command, Output};

fn npctl(args: &[&str], home: &std::path::Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_npctl"))
        .args(args)
        .env("HOME", home)
        .env_remove("NETPULSE_API_URL")
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let home = tempfile::tempdir().unwrap();
    let output = npctl(&["--help"], home.path());

    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("Netpulse"), "Should show app name");
    for command in ["get", "aggregate", "rules", "send", "status", "config"] {
        assert!(stdout.contains(command), "Should show {command} command");
    }
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let home = tempfile::tempdir().unwrap();
    let output = npctl(&["--version"], home.path());

    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("npctl"), "Should show binary name");
}

#[test]
fn test_get_anomalies_help() {
    let home = tempfile::tempdir().unwrap();
    let output = npctl(&["get", "anomalies", "--help"], home.path());

    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("--node"), "Should show node option");
    assert!(stdout.contains("--metric"), "Should show metric option");
    assert!(stdout.contains("--since"), "Should show since option");
}

#[test]
fn test_aggregate_help() {
    let home = tempfile::tempdir().unwrap();
    let output = npctl(&["aggregate", "--help"], home.path());

    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("--fn"));
    assert!(stdout.contains("--group-by-node"));
}

#[test]
fn test_invalid_format_rejected() {
    let home = tempfile::tempdir().unwrap();
    let output = npctl(&["--format", "xml", "status"], home.path());

    assert!(!output.status.success(), "Unknown format should fail");
}

#[test]
fn test_get_alerts_as_json() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/api/v1/alerts")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"[{"rule":"rx-high","node":"n1","metric":"rx","state":"firing",
                "since":"2024-03-01T12:00:00Z","value":150.0,"threshold":100.0}]"#,
        )
        .create();

    let home = tempfile::tempdir().unwrap();
    let url = server.url();
    let output = npctl(
        &["--api-url", &url, "--format", "json", "get", "alerts"],
        home.path(),
    );
    mock.assert();

    assert!(output.status.success());
    let alerts: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(alerts[0]["rule"], "rx-high");
    assert_eq!(alerts[0]["state"], "firing");
}

#[test]
fn test_rejected_reload_exits_with_error() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("POST", "/api/v1/rules/reload")
        .with_status(422)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"error":"rule set rejected",
                "details":[{"index":0,"name":"","kind":"rule name is empty"}]}"#,
        )
        .create();

    let home = tempfile::tempdir().unwrap();
    let url = server.url();
    let output = npctl(&["--api-url", &url, "rules", "reload"], home.path());
    mock.assert();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("rule name is empty"));
    assert!(stderr.contains("422"));
}

#[test]
fn test_saved_api_url_is_used() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/api/v1/flows")
        .with_status(200)
        .with_body(r#"{"computed_at":null,"flows":[]}"#)
        .create();

    let home = tempfile::tempdir().unwrap();
    let url = server.url();
    let saved = npctl(&["config", "set", "--api-url", &url], home.path());
    assert!(saved.status.success());

    let output = npctl(&["get", "flows"], home.path());
    mock.assert();
    assert!(output.status.success());
}
