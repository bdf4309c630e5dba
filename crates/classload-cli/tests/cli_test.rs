//! Tests for the `classload` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn classload() -> Command {
    let mut cmd = Command::cargo_bin("classload").unwrap();
    for var in [
        "CLASSLOAD_PATH",
        "CLASSLOAD_ENTRY_SYMBOL",
        "CLASSLOAD_VERIFY_ABI",
        "CLASSLOAD_LOG_JSON",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

/// Clap prints usage and exits with code 2 without a subcommand.
#[test]
fn test_requires_subcommand() {
    classload().assert().failure().code(2);
}

#[test]
fn test_help_lists_commands() {
    classload()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("inspect"))
        .stdout(predicate::str::contains("list-dir"));
}

#[test]
fn test_inspect_requires_path() {
    classload()
        .arg("inspect")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn test_inspect_missing_library() {
    classload()
        .arg("inspect")
        .arg("/nonexistent/libplugin.so")
        .assert()
        .failure()
        .stdout(predicate::str::contains("Status:  failed"))
        .stdout(predicate::str::contains("Library not found"))
        .stderr(predicate::str::contains("1 of 1 libraries failed to load"));
}

#[test]
fn test_inspect_json_report() {
    let temp = TempDir::new().unwrap();
    let garbage = temp.path().join("libgarbage.so");
    fs::write(&garbage, b"not a shared object").unwrap();

    let output = classload()
        .arg("inspect")
        .arg(&garbage)
        .arg("--json")
        .output()
        .unwrap();
    assert!(!output.status.success());

    let reports: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let reports = reports.as_array().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0]["loaded"], false);
    assert!(reports[0]["error"]
        .as_str()
        .unwrap()
        .contains("Failed to load library"));
}

#[test]
fn test_list_dir() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("libshapes.so"), b"").unwrap();
    fs::write(temp.path().join("notes.txt"), b"").unwrap();

    classload()
        .arg("list-dir")
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("libshapes.so"))
        .stdout(predicate::str::contains("notes.txt").not());
}

#[test]
fn test_list_dir_json() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("liba.so"), b"").unwrap();
    fs::write(temp.path().join("libb.dylib"), b"").unwrap();

    let output = classload()
        .arg("list-dir")
        .arg(temp.path())
        .arg("--json")
        .output()
        .unwrap();
    assert!(output.status.success());

    let paths: Vec<String> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(paths.len(), 2);
    assert!(paths[0].ends_with("liba.so"));
}

#[test]
fn test_list_dir_empty() {
    let temp = TempDir::new().unwrap();
    classload()
        .arg("list-dir")
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("No native libraries found"));
}

#[test]
fn test_list_dir_not_a_directory() {
    classload()
        .arg("list-dir")
        .arg("/nonexistent/plugins")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not a directory"));
}

#[test]
fn test_config_from_environment() {
    classload()
        .arg("config")
        .env("CLASSLOAD_ENTRY_SYMBOL", "custom_init")
        .env("CLASSLOAD_VERIFY_ABI", "false")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"entry_symbol\": \"custom_init\""))
        .stdout(predicate::str::contains("\"verify_abi\": false"));
}

#[test]
fn test_config_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("classload.json");
    fs::write(&path, r#"{ "search_paths": ["/opt/plugins"] }"#).unwrap();

    classload()
        .arg("config")
        .arg("--config")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("/opt/plugins"))
        .stdout(predicate::str::contains("classload_plugin_init"));
}

#[test]
fn test_verbose_logs_effective_configuration() {
    classload()
        .arg("config")
        .arg("--verbose")
        .env("CLASSLOAD_ENTRY_SYMBOL", "custom_init")
        .assert()
        .success()
        .stderr(predicate::str::contains("Effective configuration"))
        .stderr(predicate::str::contains("custom_init"));
}

#[test]
fn test_list_dir_logs_to_stderr() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("liba.so"), b"").unwrap();

    classload()
        .arg("list-dir")
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Found 1 native libraries").not())
        .stderr(predicate::str::contains("Found 1 native libraries"));
}

#[test]
fn test_invalid_config_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("classload.json");
    fs::write(&path, "{ not json").unwrap();

    classload()
        .arg("config")
        .arg("--config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config"));
}
