use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn sortie(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("sortie").unwrap();
    cmd.current_dir(dir).env("SORTIE_LOG", "warn");
    cmd
}

const GOOD_PLAN: &str = r#"{
  "name": "hello-api",
  "target_kind": "python",
  "files": [{"path": "main.py", "content": "print('hello')\n"}],
  "verify_command": "python main.py"
}"#;

const FORBIDDEN_PLAN: &str = r#"{
  "name": "cleaner",
  "target_kind": "python",
  "files": [{"path": "main.py", "content": "import os\nos.system('rm -rf /')\n"}],
  "verify_command": "python main.py"
}"#;

/// A generator that always answers with a plan whose verify command is
/// `verify`, plus a config that runs it on the local runtime.
fn project(dir: &Path, verify: &str, max_attempts: u32) {
    let plan = serde_json::json!({
        "name": "hello",
        "target_kind": "python",
        "files": [{"path": "main.py", "content": "print('hello')\n"}],
        "verify_command": verify,
    });
    let script = format!("#!/bin/sh\ncat > /dev/null\necho 'Here is the plan:'\ncat <<'EOF'\n{plan}\nEOF\n");
    std::fs::write(dir.join("gen.sh"), script).unwrap();

    let config = format!(
        r#"[orchestrator]
max_attempts = {max_attempts}

[sandbox]
runtime = "local"

[collaborators]
generator = ["sh", "{gen}"]

[store]
dir = "{store}"
"#,
        gen = dir.join("gen.sh").display(),
        store = dir.join("store").display(),
    );
    std::fs::write(dir.join("sortie.toml"), config).unwrap();
}

#[test]
fn validate_accepts_a_clean_plan() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("plan.json"), GOOD_PLAN).unwrap();
    sortie(dir.path())
        .args(["validate", "plan.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("verdict accept"));
}

#[test]
fn validate_rejects_forbidden_content() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("plan.json"), FORBIDDEN_PLAN).unwrap();
    let output = sortie(dir.path())
        .args(["validate", "plan.json", "--format", "json"])
        .assert()
        .failure()
        .code(1)
        .get_output()
        .stdout
        .clone();
    let report: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(report["verdict"], "reject");
    assert_eq!(report["name"], "cleaner");
}

#[test]
fn validate_reports_malformed_plans() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("plan.json"), "{\"name\": \"x\"}").unwrap();
    sortie(dir.path())
        .args(["validate", "plan.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("plan.json"));
}

#[test]
fn schema_describes_the_config() {
    let dir = tempfile::tempdir().unwrap();
    sortie(dir.path())
        .arg("schema")
        .assert()
        .success()
        .stdout(predicate::str::contains("orchestrator"))
        .stdout(predicate::str::contains("max_concurrent"));
}

#[test]
fn init_writes_config_once() {
    let dir = tempfile::tempdir().unwrap();
    sortie(dir.path()).arg("init").assert().success();
    let written = std::fs::read_to_string(dir.path().join("sortie.toml")).unwrap();
    assert!(written.contains("[orchestrator]"));

    sortie(dir.path())
        .arg("init")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("already exists"));
    sortie(dir.path()).args(["init", "--force"]).assert().success();
}

#[test]
fn invalid_config_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bad.toml"), "[orchestrator\nmax_attempts = ").unwrap();
    sortie(dir.path())
        .args(["--config", "bad.toml", "list"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn zero_concurrency_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("sortie.toml"), "[orchestrator]\nmax_concurrent = 0\n").unwrap();
    sortie(dir.path())
        .arg("list")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("max_concurrent"));
}

#[test]
fn run_requires_an_intent() {
    let dir = tempfile::tempdir().unwrap();
    sortie(dir.path())
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required arguments were not provided"));
}

#[test]
fn run_without_generator_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("sortie.toml"), "[sandbox]\nruntime = \"local\"\n").unwrap();
    sortie(dir.path())
        .args(["run", "anything"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("generator"));
}

#[test]
fn status_rejects_malformed_ids() {
    let dir = tempfile::tempdir().unwrap();
    sortie(dir.path())
        .args(["status", "not-a-mission"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn run_succeeds_and_is_listed_afterwards() {
    let dir = tempfile::tempdir().unwrap();
    project(dir.path(), "test -f main.py", 3);

    let output = sortie(dir.path())
        .args(["run", "say hello", "--format", "json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let mission: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(mission["status"], "SUCCEEDED");
    assert_eq!(mission["attempt"], 0);
    let id = mission["id"].as_str().unwrap().to_string();

    sortie(dir.path())
        .args(["list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("say hello"));
    sortie(dir.path())
        .args(["events", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("SUCCEEDED"))
        .stdout(predicate::str::contains("skipped"));
    sortie(dir.path())
        .args(["status", &id, "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(id.as_str()));
}

#[test]
fn failed_run_exits_with_mission_failed_and_can_be_retried() {
    let dir = tempfile::tempdir().unwrap();
    project(dir.path(), "exit 1", 1);

    let output = sortie(dir.path())
        .args(["run", "doomed", "--format", "json"])
        .assert()
        .failure()
        .code(7)
        .get_output()
        .stdout
        .clone();
    let mission: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(mission["status"], "FAILED");
    assert_eq!(mission["failure"]["reason"], "retries_exhausted");
    let id = mission["id"].as_str().unwrap().to_string();

    project(dir.path(), "true", 1);
    let output = sortie(dir.path())
        .args(["retry", &id, "--format", "json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let retried: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(retried["retry_of"], id.as_str());
    assert_eq!(retried["intent"], "doomed");
}
