//! End-to-end tests for the geostage binary
//!
//! Validates the process interface: configuration loading, the validate
//! subcommand and the documented exit codes.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

fn write_file(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn valid_config(dir: &Path) -> std::path::PathBuf {
    write_file(
        dir,
        "config.yaml",
        &format!(
            r#"
environment: development
paths:
  downloads: {downloads}
  staging: {staging}
"#,
            downloads = dir.join("downloads").display(),
            staging = dir.join("staging").display(),
        ),
    )
}

#[test]
fn validate_accepts_well_formed_documents() {
    let tmp = tempfile::tempdir().unwrap();
    let config = valid_config(tmp.path());
    let sources = write_file(
        tmp.path(),
        "sources.yaml",
        r#"
sources:
  - name: Naturreservat
    authority: NVV
    type: file
    url: https://example.com/naturreservat.zip
"#,
    );
    let mappings = write_file(tmp.path(), "mappings.yaml", "mappings: []\n");

    let mut cmd = Command::cargo_bin("geostage").unwrap();
    cmd.arg("validate")
        .arg("--config")
        .arg(&config)
        .arg("--sources")
        .arg(&sources)
        .arg("--mappings")
        .arg(&mappings);

    cmd.assert().success();
}

#[test]
fn invalid_settings_exit_with_configuration_error() {
    let tmp = tempfile::tempdir().unwrap();
    let config = write_file(tmp.path(), "config.yaml", "environment: circus\n");
    let sources = write_file(tmp.path(), "sources.yaml", "sources: []\n");

    let mut cmd = Command::cargo_bin("geostage").unwrap();
    cmd.arg("validate")
        .arg("--config")
        .arg(&config)
        .arg("--sources")
        .arg(&sources);

    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("environment"));
}

#[test]
fn run_with_zero_enabled_sources_exits_cleanly() {
    let tmp = tempfile::tempdir().unwrap();
    let config = valid_config(tmp.path());
    let sources = write_file(
        tmp.path(),
        "sources.yaml",
        r#"
sources:
  - name: Avstängd källa
    authority: NVV
    type: file
    url: https://example.invalid/a.zip
    enabled: false
"#,
    );

    let mut cmd = Command::cargo_bin("geostage").unwrap();
    cmd.arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--sources")
        .arg(&sources)
        .arg("--mappings")
        .arg(tmp.path().join("missing-mappings.yaml"));

    cmd.assert().success();
}

#[test]
fn malformed_inventory_exits_with_configuration_error() {
    let tmp = tempfile::tempdir().unwrap();
    let config = valid_config(tmp.path());
    let sources = write_file(tmp.path(), "sources.yaml", "sources: {not: a list}\n");

    let mut cmd = Command::cargo_bin("geostage").unwrap();
    cmd.arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--sources")
        .arg(&sources);

    cmd.assert().failure().code(1);
}
