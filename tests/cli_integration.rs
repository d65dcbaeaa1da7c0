// CLI integration tests for the stdin tee.
use std::io::Write;
use std::process::{Command, Stdio};

use serde_json::Value;

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_logring");
    Command::new(exe)
}

fn parse_json(value: &str) -> Value {
    serde_json::from_str(value).expect("valid json")
}

#[test]
fn stdin_is_written_to_compressed_ring() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ring_dir = temp.path().join("logs");

    let mut child = cmd()
        .args([
            "--dir",
            ring_dir.to_str().unwrap(),
            "--prefix",
            "svc",
            "--max-total-size",
            "4M",
            "--files",
            "3",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(b"alpha\nbeta\n")
        .expect("write stdin");
    let output = child.wait_with_output().expect("wait");
    assert!(output.status.success());

    let summary = parse_json(std::str::from_utf8(&output.stdout).expect("utf8").trim());
    assert_eq!(summary["prefix"], "svc");
    assert_eq!(summary["bytes"], 11);
    assert_eq!(summary["rotations"], 0);
    assert!(summary["last_file"].as_str().unwrap().ends_with("svc.01.zstd"));

    let raw = std::fs::read(ring_dir.join("svc.01.zstd")).expect("read");
    let decoded = zstd::stream::decode_all(raw.as_slice()).expect("decode");
    assert_eq!(decoded, b"alpha\nbeta\n");
}

#[test]
fn plain_mode_uses_log_suffix_and_config_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ring_dir = temp.path().join("logs");
    let config = temp.path().join("ring.json");
    std::fs::write(&config, r#"{"max_total_size": 2097152, "files": 2}"#).expect("config");

    let mut child = cmd()
        .args([
            "--dir",
            ring_dir.to_str().unwrap(),
            "--prefix",
            "svc",
            "--plain",
            "--config",
            config.to_str().unwrap(),
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(b"plain text")
        .expect("write stdin");
    let status = child.wait().expect("wait");
    assert!(status.success());

    assert_eq!(std::fs::read(ring_dir.join("svc.01.log")).expect("read"), b"plain text");
}

#[test]
fn undersized_budget_is_rejected_with_json_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ring_dir = temp.path().join("logs");

    let output = cmd()
        .args([
            "--dir",
            ring_dir.to_str().unwrap(),
            "--prefix",
            "svc",
            "--max-total-size",
            "1M",
        ])
        .stdin(Stdio::null())
        .env("RUST_LOG", "off")
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(2));

    let stderr = String::from_utf8_lossy(&output.stderr);
    let line = stderr.lines().last().expect("error line");
    let err = parse_json(line);
    assert_eq!(err["error"]["kind"], "Usage");
    assert!(!ring_dir.exists());
}
