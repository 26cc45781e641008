//! Behavioural tests for `hotswap simulate`.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;

fn simulate() -> Command {
    let mut cmd = cargo_bin_cmd!("hotswap");
    cmd.env("HOTSWAP_HEALTH_POLL_INTERVAL_MS", "5")
        .env("HOTSWAP_RETRY_BACKOFF_MS", "1")
        .env("HOTSWAP_AGENT_TIMEOUT_MS", "500")
        .arg("simulate");
    cmd
}

#[test]
fn cli_without_arguments_prints_help() {
    cargo_bin_cmd!("hotswap")
        .assert()
        .failure()
        .stderr(predicate::str::contains("simulate"));
}

#[test]
fn simulate_prints_task_lines_and_listing() {
    simulate()
        .args(["--persistent-disk", "1000", "--recreate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Creating missing vms: foobar/"))
        .stdout(predicate::str::contains("Downloading packages: foobar/"))
        .stdout(predicate::str::contains("Updating instance foobar: 1/1"))
        .stdout(predicate::str::contains("1/1 instance(s) updated"));
}

#[test]
fn simulate_without_recreate_leaves_instances_alone() {
    simulate()
        .args(["--instances", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Creating missing vms").not())
        .stdout(predicate::str::contains("0/0 instance(s) updated"));
}

#[test]
fn simulate_emits_json_report() {
    let output = simulate()
        .args(["--instances", "3", "--max-in-flight", "2", "--recreate", "--json"])
        .output()
        .unwrap_or_else(|err| panic!("run hotswap: {err}"));
    assert!(output.status.success(), "{output:?}");

    let document: Value = serde_json::from_slice(&output.stdout)
        .unwrap_or_else(|err| panic!("stdout should be JSON: {err}"));
    let instances = document["report"]["instances"]
        .as_array()
        .unwrap_or_else(|| panic!("report lists instances: {document}"));
    assert_eq!(instances.len(), 3);
    assert!(instances.iter().all(|entry| entry["outcome"] == "done"));
    assert_eq!(document["vms"].as_array().map(Vec::len), Some(3));
    assert!(document["report"]["peak_in_flight"].as_u64().is_some_and(|peak| peak <= 2));
}

#[test]
fn rejected_mount_fails_the_deploy() {
    simulate()
        .args(["--persistent-disk", "1000", "--recreate", "--fault", "reject-mount"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("agent_rejected"))
        .stdout(predicate::str::contains("0/1 instance(s) updated"));
}

#[test]
fn invalid_configuration_is_reported() {
    simulate()
        .args(["--recreate", "--strategy", "blue-green"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("HOTSWAP_STRATEGY"));
}
