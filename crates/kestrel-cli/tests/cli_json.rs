//! Integration tests for `kestrel --json` output.
//!
//! These tests verify:
//! - `build --json` prints the manifest as one JSON object on stdout
//! - a failing build exits non-zero with its diagnostics in the manifest
//! - `resolve` and `resolve-file` report `{status, result}` and `{ok, path}`

use std::process::Command;
use tempfile::tempdir;

fn kestrel() -> Command {
    Command::new(env!("CARGO_BIN_EXE_kestrel"))
}

#[test]
fn test_build_json_prints_manifest_and_writes_outdir() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("index.js"), "import './dep';\n").unwrap();
    std::fs::write(dir.path().join("dep.js"), "module.exports = 1;\n").unwrap();

    let output = kestrel()
        .args(["build", "--json", "--entry", "main=./index.js", "--outdir", "dist", "--cwd"])
        .arg(dir.path())
        .output()
        .expect("failed to run kestrel");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).expect("stdout is JSON");
    assert_eq!(json["success"], true);
    assert_eq!(json["chunks"][0]["name"], "main");
    assert_eq!(json["modules"].as_array().unwrap().len(), 2);
    assert!(json["errors"].as_array().unwrap().is_empty());
    assert!(dir.path().join("dist/main.js").is_file());
}

#[test]
fn test_build_json_reports_errors_with_exit_code() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("index.js"), "import './missing';\n").unwrap();

    let output = kestrel()
        .args(["build", "--json", "--entry", "main=./index.js", "--cwd"])
        .arg(dir.path())
        .output()
        .expect("failed to run kestrel");
    assert_eq!(output.status.code(), Some(1));

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).expect("stdout is JSON");
    assert_eq!(json["success"], false);
    assert_eq!(json["errors"][0]["code"], "RESOLVE_ERROR");
}

#[test]
fn test_resolve_json() {
    let dir = tempdir().unwrap();
    std::fs::create_dir(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/util.ts"), "").unwrap();

    let output = kestrel()
        .args(["resolve", "./util", "--dir", "src", "--json", "--cwd"])
        .arg(dir.path())
        .output()
        .expect("failed to run kestrel");
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["status"], true);
    assert!(json["result"].as_str().unwrap().ends_with("src/util.ts"));

    let output = kestrel()
        .args(["resolve", "./nope", "--json", "--cwd"])
        .arg(dir.path())
        .output()
        .expect("failed to run kestrel");
    assert_eq!(output.status.code(), Some(1));
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["status"], false);
    assert!(json.get("result").is_none());
}

#[test]
fn test_resolve_file_json_keeps_query() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("logo.svg"), "<svg/>").unwrap();

    let output = kestrel()
        .args(["resolve-file", "--json"])
        .arg(dir.path())
        .arg("./logo.svg?url")
        .output()
        .expect("failed to run kestrel");
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["ok"], true);
    assert!(json["path"].as_str().unwrap().ends_with("logo.svg?url"));
}
