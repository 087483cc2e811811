//! Integration tests for the critrace binary
#![allow(deprecated)] // suppress assert_cmd::Command::cargo_bin deprecation in tests

use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_config_prints_effective_toml() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("critrace");
    cmd.arg("config")
        .env("CRITRACE_USE_CRITICAL_TRACE", "1")
        .env("CRITRACE_SAMPLING_FREQ", "250");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("use_critical_trace = true"))
        .stdout(predicate::str::contains("sampling_freq = 250"))
        .stdout(predicate::str::contains("mode = \"trace\""));
}

#[test]
fn test_config_skips_bad_value() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("critrace");
    cmd.arg("config")
        .env("CRITRACE_USE_TRACE", "maybe")
        .env("CRITRACE_THREAD_POOL_SIZE", "3");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("use_trace = true"))
        .stdout(predicate::str::contains("thread_pool_size = 3"))
        .stderr(predicate::str::contains("CRITRACE_USE_TRACE"));
}

#[test]
fn test_demo_then_inspect() {
    let dir = TempDir::new().unwrap();

    let mut demo = assert_cmd::cargo::cargo_bin_cmd!("critrace");
    demo.arg("demo")
        .arg("--threads")
        .arg("2")
        .arg("--depth")
        .arg("2")
        .arg("--output-dir")
        .arg(dir.path())
        .env("CRITRACE_VERBOSE", "-1");
    demo.assert()
        .success()
        .stdout(predicate::str::contains("Critical path: main -> worker-1/level-0"))
        .stdout(predicate::str::contains("Trace written to"));

    let trace = dir.path().join("trace.msgpack");
    assert!(trace.exists());
    assert!(dir.path().join("critical-trace.json").exists());

    let mut inspect = assert_cmd::cargo::cargo_bin_cmd!("critrace");
    inspect.arg("inspect").arg(&trace);
    inspect
        .assert()
        .success()
        .stdout(predicate::str::contains("worker-0/level-1"))
        .stdout(predicate::str::contains("(0 unbalanced)"));
}

#[test]
fn test_inspect_missing_file_fails() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("critrace");
    cmd.arg("inspect").arg("/nonexistent/trace.msgpack");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("failed to read"));
}

#[test]
fn test_inspect_rejects_garbage() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("garbage.msgpack");
    std::fs::write(&path, b"\xc1\xc1\xc1 definitely not a trace").unwrap();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("critrace");
    cmd.arg("inspect").arg(&path);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("is not a critrace trace"));
}
