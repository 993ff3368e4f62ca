//! Command-line tests for the clawscaler binary.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::NamedTempFile;

const SCENARIO: &str = r#"{
    "nodepools": [{
        "name": "default",
        "disruption": { "consolidate_after_secs": 0, "budgets": [{ "nodes": "100%" }] }
    }],
    "instance_types": [{
        "name": "medium",
        "capacity": { "cpu_millis": 4000, "memory_bytes": 17179869184, "pods": 110 },
        "offerings": [{ "zone": "zone-a", "capacity_type": "on-demand", "price": 0.1 }]
    }],
    "nodes": [{
        "name": "idle",
        "labels": {
            "claw.dev/nodepool": "default",
            "topology.kubernetes.io/zone": "zone-a",
            "node.kubernetes.io/instance-type": "medium"
        },
        "allocatable": { "cpu_millis": 4000, "memory_bytes": 17179869184, "pods": 110 }
    }],
    "pods": [
        { "name": "web-1", "requests": { "cpu_millis": 6000 } },
        { "name": "web-2", "requests": { "cpu_millis": 64000 } }
    ]
}"#;

fn file(content: &str, suffix: &str) -> NamedTempFile {
    let mut f = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("tempfile");
    f.write_all(content.as_bytes()).expect("write");
    f
}

fn clawscaler() -> Command {
    Command::cargo_bin("clawscaler").expect("binary")
}

#[test]
fn check_config_accepts_valid_files() {
    let config = file("workers = 2\n[disruption]\ninterval_secs = 30\n", ".toml");
    clawscaler()
        .args(["check-config", "--config"])
        .arg(config.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid"))
        .stdout(predicate::str::contains("workers: 2"));
}

#[test]
fn check_config_rejects_invalid_files() {
    let config = file("workers = 0\n", ".toml");
    clawscaler()
        .args(["check-config", "--config"])
        .arg(config.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("workers must be greater than 0"));
}

#[test]
fn simulate_reports_launches_and_unschedulable_pods() {
    let scenario = file(SCENARIO, ".json");
    let output = clawscaler()
        .args(["simulate", "--scenario"])
        .arg(scenario.path())
        .output()
        .expect("run");
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    // web-1 needs more than the idle node or any offering holds
    assert_eq!(report["node_claims"].as_array().map(Vec::len), Some(0));
    assert!(report["unschedulable"]["default/web-1"].is_string());
    assert!(report["unschedulable"]["default/web-2"].is_string());
}

#[test]
fn disrupt_plans_the_idle_node() {
    let scenario = file(SCENARIO, ".json");
    let output = clawscaler()
        .args(["disrupt", "--scenario"])
        .arg(scenario.path())
        .output()
        .expect("run");
    assert!(output.status.success());

    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    let commands = plan["commands"].as_array().expect("commands");
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0]["targets"][0]["node"], "idle");
}

#[test]
fn missing_scenarios_fail() {
    clawscaler()
        .args(["simulate", "--scenario", "/nonexistent/scenario.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read scenario file"));
}
