//! CLI tests for the `anvil` binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn anvil(dir: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("anvil");
    cmd.current_dir(dir)
        .env_remove("ANVIL_AGENT_CMD")
        .env_remove("ANVIL_MAX_JUMPS")
        .env_remove("ANVIL_QUALITY_THRESHOLD")
        .env("NO_COLOR", "1");
    cmd
}

fn project(config: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join(".anvil")).unwrap();
    fs::write(dir.path().join(".anvil/anvil.toml"), config).unwrap();
    fs::write(
        dir.path().join("plan.json"),
        r#"{ "name": "cli-demo", "goal": "print hello" }"#,
    )
    .unwrap();
    dir
}

fn only_workflow_id(dir: &Path) -> String {
    let output = anvil(dir).args(["list", "--json"]).output().unwrap();
    assert!(output.status.success());
    let records: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    records[0]["id"].as_str().unwrap().to_string()
}

const PASSING: &str = r#"
[executor]
agent_command = "true"
tests = "true"
"#;

mod basics {
    use super::*;

    #[test]
    fn test_help() {
        cargo_bin_cmd!("anvil")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("resume"));
    }

    #[test]
    fn test_version() {
        cargo_bin_cmd!("anvil").arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_state_dir() {
        let dir = TempDir::new().unwrap();
        anvil(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized"));
        assert!(dir.path().join(".anvil/anvil.toml").exists());
        assert!(dir.path().join(".anvil/locks").is_dir());

        anvil(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }

    #[test]
    fn test_list_empty_project() {
        let dir = TempDir::new().unwrap();
        anvil(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No workflows recorded."));
    }
}

mod config {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        let dir = TempDir::new().unwrap();
        anvil(dir.path()).arg("init").assert().success();
        anvil(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Valid"));
    }

    #[test]
    fn test_validate_reports_problems() {
        let dir = project("[quality]\nthreshold = 1.5\n");
        anvil(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("quality.threshold"));
    }

    #[test]
    fn test_show_includes_env_override() {
        let dir = project("");
        anvil(dir.path())
            .args(["config", "show"])
            .env("ANVIL_MAX_JUMPS", "12")
            .assert()
            .success()
            .stdout(predicate::str::contains("max_jumps = 12"));
    }

    #[test]
    fn test_run_refuses_invalid_config() {
        let dir = project("[limits]\nmax_jumps = 1\n");
        anvil(dir.path())
            .args(["run", "plan.json"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("limits.max_jumps"));
    }
}

mod workflows {
    use super::*;

    #[test]
    fn test_run_to_success() {
        let dir = project(PASSING);
        anvil(dir.path())
            .args(["run", "plan.json"])
            .assert()
            .code(0)
            .stdout(predicate::str::contains("SUCCEEDED"));

        let id = only_workflow_id(dir.path());
        anvil(dir.path())
            .args(["status", &id])
            .assert()
            .success()
            .stdout(predicate::str::contains("cli-demo"))
            .stdout(predicate::str::contains("SUCCEEDED"));

        let output = anvil(dir.path())
            .args(["events", &id, "--json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let events: Vec<serde_json::Value> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(events[0]["kind"]["type"], "workflow_created");
        assert_eq!(events[0]["seq"], 1);
        let last = events.last().unwrap();
        assert_eq!(last["kind"]["type"], "workflow_status_changed");
        assert_eq!(last["kind"]["status"], "SUCCEEDED");
    }

    #[test]
    fn test_terminal_run_exits_with_failure() {
        let dir = project(
            r#"
[limits]
max_repair_attempts = 1
max_reimplementations = 1

[executor]
agent_command = "true"
tests = "false"
"#,
        );
        anvil(dir.path())
            .args(["run", "plan.json"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("TERMINAL"));

        let id = only_workflow_id(dir.path());
        anvil(dir.path())
            .args(["events", &id, "--from", "2"])
            .assert()
            .success()
            .stdout(predicate::str::contains("jump -> repair"))
            .stdout(predicate::str::contains("jump -> implement"));
    }

    #[test]
    fn test_resume_with_nothing_to_do() {
        let dir = project(PASSING);
        anvil(dir.path())
            .arg("resume")
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to resume."));
    }

    #[test]
    fn test_archive_hides_workflow() {
        let dir = project(PASSING);
        anvil(dir.path()).args(["run", "plan.json"]).assert().success();
        let id = only_workflow_id(dir.path());

        anvil(dir.path()).args(["archive", &id]).assert().success();
        anvil(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No workflows recorded."));
        anvil(dir.path())
            .args(["list", "--all"])
            .assert()
            .success()
            .stdout(predicate::str::contains("(archived)"));
    }

    #[test]
    fn test_unknown_workflow_errors() {
        let dir = project(PASSING);
        anvil(dir.path())
            .args(["events", "no-such-workflow"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
        anvil(dir.path())
            .args(["cancel", "no-such-workflow"])
            .assert()
            .failure();
    }

    #[test]
    fn test_missing_plan_file() {
        let dir = project(PASSING);
        anvil(dir.path())
            .args(["run", "missing.json"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to load plan"));
    }
}
