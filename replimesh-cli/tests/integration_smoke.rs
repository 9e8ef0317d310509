//! Smoke tests to verify command wiring against the memory driver

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::NamedTempFile;

const CONFIG: &str = r#"
[instances]
A = "memory://a"
B = "memory://b"
C = "memory://c"

[roles]
guardian = ["A", "B"]
administrative_staff = ["A", "C"]
tutor = ["A"]
"#;

fn config_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    file
}

fn replimesh(config: &NamedTempFile) -> Command {
    let mut cmd = Command::cargo_bin("replimesh").unwrap();
    cmd.env_remove("REPLIMESH_CONFIG")
        .env_remove("REPLIMESH_ENV")
        .arg("--config")
        .arg(config.path());
    cmd
}

// === Help ===

#[test]
fn test_top_level_help() {
    let mut cmd = Command::cargo_bin("replimesh").unwrap();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("instances"))
        .stdout(predicate::str::contains("transaction"));
}

#[test]
fn test_write_help() {
    let mut cmd = Command::cargo_bin("replimesh").unwrap();
    cmd.arg("write").arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Roles whose data the write affects"));
}

#[test]
fn test_completions_bash() {
    let mut cmd = Command::cargo_bin("replimesh").unwrap();
    cmd.arg("completions").arg("bash");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("replimesh"));
}

// === Config ===

#[test]
fn test_config_validate() {
    let config = config_file();
    replimesh(&config)
        .arg("config")
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("3 instances, 3 roles"))
        .stdout(predicate::str::contains("Configuration valid"));
}

#[test]
fn test_config_validate_rejects_unknown_role() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[instances]\nA = \"memory://a\"\n\n[roles]\njanitor = [\"A\"]").unwrap();

    replimesh(&file)
        .arg("config")
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown role 'janitor'"));
}

#[test]
fn test_config_path_prefers_flag() {
    let config = config_file();
    replimesh(&config)
        .arg("config")
        .arg("path")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            config.path().file_name().unwrap().to_str().unwrap(),
        ));
}

// === Routing ===

#[test]
fn test_instances_json() {
    let config = config_file();
    replimesh(&config)
        .arg("instances")
        .arg("--json")
        .assert()
        .success()
        .stdout(predicate::str::contains("memory://a"))
        .stdout(predicate::str::contains("\"PA\""));
}

#[test]
fn test_route_read_stays_within_role() {
    let config = config_file();
    replimesh(&config)
        .args(["route", "--role", "tutor"])
        .assert()
        .success()
        .stdout(predicate::str::contains("read routed to A"));
}

#[test]
fn test_route_write_requires_instance() {
    let config = config_file();
    replimesh(&config)
        .args(["route", "--write"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("instance"));
}

#[test]
fn test_route_write_shows_destinations() {
    let config = config_file();
    replimesh(&config)
        .args(["route", "--write", "--instance", "A", "--affects", "guardian,PA"])
        .assert()
        .success()
        .stdout(predicate::str::contains("replicates to B, C"));
}

// === Operations ===

#[test]
fn test_write_insert_one() {
    let config = config_file();
    replimesh(&config)
        .args([
            "write",
            "--instance",
            "A",
            "--kind",
            "insertOne",
            "--collection",
            "notices",
            "--data",
            r#"{"_id": "n-1", "text": "meeting"}"#,
            "--affects",
            "guardian",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"insertedId\": \"n-1\""));
}

#[test]
fn test_write_rejects_read_kind() {
    let config = config_file();
    replimesh(&config)
        .args(["write", "--instance", "A", "--kind", "find", "--collection", "notices"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("is a read"));
}

#[test]
fn test_read_on_empty_collection() {
    let config = config_file();
    replimesh(&config)
        .args(["read", "--collection", "notices", "--kind", "countDocuments"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0"));
}

#[test]
fn test_transaction_from_file() {
    let config = config_file();
    let mut ops = NamedTempFile::new().unwrap();
    write!(
        ops,
        r#"[
            {{"operation": "insertOne", "collection": "T", "data": {{"_id": 1, "status": "new"}}}},
            {{"operation": "updateOne", "collection": "T", "filter": {{"_id": 1}}, "data": {{"$set": {{"status": "done"}}}}}},
            {{"operation": "countDocuments", "collection": "T", "filter": {{"status": "done"}}}}
        ]"#
    )
    .unwrap();

    replimesh(&config)
        .args(["transaction", "--instance", "A", "--file"])
        .arg(ops.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"modifiedCount\": 1"));
}

#[test]
fn test_replicate_dry_run_prints_envelope() {
    let config = config_file();
    let mut op = NamedTempFile::new().unwrap();
    write!(op, r#"{{"operation": "deleteOne", "collection": "T", "filter": {{"_id": 1}}}}"#).unwrap();

    replimesh(&config)
        .args(["replicate", "--source", "B", "--dry-run", "--operation"])
        .arg(op.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"event_type\": \"mongodb-replication\""))
        .stdout(predicate::str::contains("destinationInstances"));
}

#[test]
fn test_unknown_instance_rejected() {
    let config = config_file();
    replimesh(&config)
        .args(["write", "--instance", "Z", "--kind", "deleteMany", "--collection", "T"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no connection URL"));
}
