// Copyright © 2026 The vmsnap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::ffi::OsStr;
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use serde_json::Value;
use wait_timeout::ChildExt;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

struct SnapshotCommand {
    command: Command,
}

struct SnapshotOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl SnapshotCommand {
    fn new() -> Self {
        let mut command = Command::new(env!("CARGO_BIN_EXE_vmsnap"));
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        Self { command }
    }

    fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command.args(args);
        self
    }

    fn run(&mut self) -> SnapshotOutput {
        let mut child = self.command.spawn().unwrap();
        let status = child_wait_timeout(&mut child);

        let mut stdout = String::new();
        child.stdout.take().unwrap().read_to_string(&mut stdout).unwrap();
        let mut stderr = String::new();
        child.stderr.take().unwrap().read_to_string(&mut stderr).unwrap();

        SnapshotOutput {
            status,
            stdout,
            stderr,
        }
    }
}

// Wait the child process for a given timeout
fn child_wait_timeout(child: &mut Child) -> ExitStatus {
    match child.wait_timeout(TEST_TIMEOUT).unwrap() {
        Some(status) => status,
        None => {
            let _ = child.kill();
            panic!("vmsnap did not complete within {TEST_TIMEOUT:?}");
        }
    }
}

/// Decode the payload of every entry of a snapshot sequence.
fn sections(snapshot: &Value, key: &str) -> Vec<Value> {
    snapshot
        .get(key)
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .map(|entry| serde_json::from_str(entry["state"].as_str().unwrap()).unwrap())
                .collect()
        })
        .unwrap_or_default()
}

fn assert_consistent(snapshot: &Value) {
    let issued: u64 = sections(snapshot, "vcpus")
        .iter()
        .map(|v| v["io_requests"].as_u64().unwrap())
        .sum();
    let completed: u64 = sections(snapshot, "devices")
        .iter()
        .map(|d| d["completed"].as_u64().unwrap())
        .sum();
    assert_eq!(issued, completed);
}

#[test]
fn test_snapshot_to_stdout() {
    let output = SnapshotCommand::new()
        .args([
            "--cpus",
            "2",
            "--device",
            "net0",
            "--device",
            "blk0",
            "--device",
            "rng",
            "--run-ms",
            "50",
            "--snapshot",
            "-",
        ])
        .run();
    assert!(output.status.success(), "{}", output.stderr);

    let snapshot: Value = serde_json::from_str(&output.stdout).unwrap();

    let vcpus = sections(&snapshot, "vcpus");
    assert_eq!(
        vcpus.iter().map(|v| v["id"].as_u64().unwrap()).collect::<Vec<_>>(),
        vec![0, 1]
    );

    let devices = sections(&snapshot, "devices");
    assert_eq!(
        devices
            .iter()
            .map(|d| d["id"].as_str().unwrap().to_owned())
            .collect::<Vec<_>>(),
        vec!["net0", "blk0", "rng"]
    );

    assert_consistent(&snapshot);
}

#[test]
fn test_snapshot_paused_vm_to_file() {
    let path: PathBuf =
        std::env::temp_dir().join(format!("vmsnap-state-{}.json", std::process::id()));

    let output = SnapshotCommand::new()
        .args(["--cpus", "1", "--device", "serial", "--paused", "--snapshot"])
        .args([&path])
        .run();
    assert!(output.status.success(), "{}", output.stderr);
    assert!(output.stdout.is_empty());

    let snapshot: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    fs::remove_file(&path).unwrap();

    assert_eq!(sections(&snapshot, "vcpus").len(), 1);
    assert_eq!(sections(&snapshot, "devices").len(), 1);
    assert_consistent(&snapshot);
}

#[test]
fn test_snapshot_without_devices_omits_them() {
    let output = SnapshotCommand::new()
        .args(["--run-ms", "10", "--snapshot", "-"])
        .run();
    assert!(output.status.success(), "{}", output.stderr);

    let snapshot: Value = serde_json::from_str(&output.stdout).unwrap();
    assert!(snapshot.get("devices").is_none());
    assert_eq!(sections(&snapshot, "vcpus").len(), 1);
}

#[test]
fn test_invalid_config_fails() {
    let output = SnapshotCommand::new()
        .args(["--cpus", "0", "--snapshot", "-"])
        .run();
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
    assert!(output.stderr.contains("No vCPUs to boot"));

    let output = SnapshotCommand::new()
        .args(["--device", "net0", "--device", "net0", "--snapshot", "-"])
        .run();
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stderr.contains("net0 is not unique"));
}

#[test]
fn test_device_quiesce_timeout_fails() {
    let output = SnapshotCommand::new()
        .args([
            "--device",
            "slow0",
            "--device-latency-ms",
            "50",
            "--quiesce-timeout-ms",
            "1",
            "--run-ms",
            "30",
            "--snapshot",
            "-",
        ])
        .run();
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
    assert!(output.stderr.contains("Failed to read device state"));
    assert!(output.stderr.contains("slow0"));
}
