// CLI integration tests for rpc-reactor
// Tests the command-line interface functionality

use std::io::Write;
use std::process::Command;

fn rpc_reactor() -> Command {
    Command::new(env!("CARGO_BIN_EXE_rpc-reactor"))
}

/// Test that --help flag shows help message with subcommands
#[test]
fn test_help_flag_shows_subcommands() {
    let output = rpc_reactor()
        .arg("--help")
        .output()
        .expect("Failed to execute command");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "Help should exit with success");
    assert!(
        stdout.contains("demo") && stdout.contains("print-config"),
        "Help should list subcommands. Got: {}",
        stdout
    );
}

/// Test that print-config renders the settings file merged with defaults
#[test]
fn test_print_config_shows_effective_settings() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[transport]\nlatency_ms = 7").unwrap();

    let output = rpc_reactor()
        .arg("print-config")
        .arg("--config")
        .arg(file.path())
        .output()
        .expect("Failed to execute command");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    assert!(stdout.contains("latency_ms = 7"), "Got: {}", stdout);
    assert!(stdout.contains("halt_policy = \"drain\""), "Got: {}", stdout);
}

/// Test that an invalid settings file is reported and fails the command
#[test]
fn test_invalid_config_fails() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[transport]\nworker_threads = 0").unwrap();

    let output = rpc_reactor()
        .arg("print-config")
        .arg("--config")
        .arg(file.path())
        .output()
        .expect("Failed to execute command");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success());
    assert!(stderr.contains("Invalid configuration"), "Got: {}", stderr);
}

/// Test that the demo runs to completion, with and without cancellation
#[test]
fn test_demo_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("absent.toml");

    for extra in [&[][..], &["--cancel"][..]] {
        let output = rpc_reactor()
            .args(["demo", "--items", "3", "--latency-ms", "1", "--config"])
            .arg(&config)
            .args(extra)
            .env("RUST_LOG", "info")
            .output()
            .expect("Failed to execute command");

        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(output.status.success(), "Demo failed: {}", stderr);
        assert!(stderr.contains("Stream finished"), "Got: {}", stderr);
        assert!(stderr.contains("Second request rejected"), "Got: {}", stderr);
    }
}
