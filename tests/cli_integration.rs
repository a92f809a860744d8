//! Integration tests for the codex-loop CLI

use assert_cmd::cargo;
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

/// Get a Command for the codex-loop binary
fn codex_loop() -> Command {
    let mut cmd = Command::new(cargo::cargo_bin!("codex-loop"));
    cmd.env_remove("RUST_LOG").env_remove("CODEX_LOOP_AGENT_BIN");
    cmd
}

fn git_repo() -> TempDir {
    let temp = TempDir::new().unwrap();
    let status = std::process::Command::new("git")
        .args(["init", "-q"])
        .current_dir(temp.path())
        .status()
        .expect("git should run");
    assert!(status.success());
    std::fs::write(temp.path().join("request.md"), "Add a greeting module.\n").unwrap();
    temp
}

#[cfg(unix)]
fn write_agent(dir: &Path, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-agent.sh");
    std::fs::write(&path, format!("#!/bin/sh\ncat > /dev/null\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[test]
fn test_help() {
    codex_loop()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Drive a coding agent"));
}

#[test]
fn test_version() {
    codex_loop()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_run_requires_request() {
    codex_loop()
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--request"));
}

#[test]
fn test_run_outside_git_repo() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("request.md"), "x").unwrap();

    codex_loop()
        .arg("--root")
        .arg(temp.path())
        .args(["run", "--request"])
        .arg(temp.path().join("request.md"))
        .assert()
        .code(6)
        .stderr(predicate::str::contains("Not inside a git repository"));
}

#[test]
fn test_run_missing_request_file() {
    let repo = git_repo();

    codex_loop()
        .arg("--root")
        .arg(repo.path())
        .args(["run", "--verify-cmd", "true", "--request"])
        .arg(repo.path().join("missing.md"))
        .assert()
        .code(6)
        .stderr(predicate::str::contains("Missing required file"));
}

#[test]
fn test_run_rejects_invalid_coverage() {
    let repo = git_repo();

    codex_loop()
        .arg("--root")
        .arg(repo.path())
        .args(["run", "--min-coverage", "150", "--verify-cmd", "true", "--request"])
        .arg(repo.path().join("request.md"))
        .assert()
        .code(7)
        .stderr(predicate::str::contains("min_coverage"));
}

#[cfg(unix)]
#[test]
fn test_run_tooling_detector_failure() {
    let repo = git_repo();

    codex_loop()
        .arg("--root")
        .arg(repo.path())
        .args(["run", "--tooling-cmd", "echo not-json", "--request"])
        .arg(repo.path().join("request.md"))
        .assert()
        .code(6)
        .stderr(predicate::str::contains("Tooling detection failed"));
}

#[cfg(unix)]
#[test]
fn test_run_end_to_end_success() {
    let repo = git_repo();
    let agent = write_agent(repo.path(), "echo implemented >> work.txt\necho agent done");

    codex_loop()
        .arg("--root")
        .arg(repo.path())
        .args(["run", "--verify-cmd", "echo 'TOTAL 10 1 90%'", "--agent-bin"])
        .arg(&agent)
        .arg("--request")
        .arg(repo.path().join("request.md"))
        .assert()
        .success()
        .stdout(predicate::str::contains("SUCCESS"));

    let logs = repo.path().join(".cursor/.hook_state/codex_loop");
    assert!(logs.join("cycle_01_agent_stdout.txt").exists());
    assert!(logs.join("cycle_01_verify_stdout.txt").exists());
    assert!(!logs.join("final_report.md").exists());
    assert!(repo.path().join("work.txt").exists());
}

#[cfg(unix)]
#[test]
fn test_run_detected_command_and_blocked_stop() {
    let repo = git_repo();
    let agent = write_agent(repo.path(), "echo nothing to do");
    let detector = r#"echo '{"python":{"commands":{"tests":"echo 1 failed; exit 1"}}}'"#;

    codex_loop()
        .arg("--root")
        .arg(repo.path())
        .args(["run", "--max-blocked-repeats", "2", "--log-dir", "loop-logs"])
        .args(["--tooling-cmd", detector, "--agent-bin"])
        .arg(&agent)
        .arg("--request")
        .arg(repo.path().join("request.md"))
        .assert()
        .success()
        .stdout(predicate::str::contains("REPEATED_BLOCKED_FAILURE"))
        .stdout(predicate::str::contains("NO_NET_CHANGE"));

    assert!(repo.path().join("loop-logs/final_report.md").exists());
}

#[test]
fn test_classify_coverage_output() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("out.txt");
    std::fs::write(&file, "5 passed\nTOTAL 120 40 66%\n").unwrap();

    codex_loop()
        .arg("classify")
        .arg(&file)
        .args(["--exit-code", "0", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"category\": \"OK\""))
        .stdout(predicate::str::contains("\"coverage\": 66.0"));
}

#[test]
fn test_classify_permission_denied() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("out.txt");
    std::fs::write(&file, "open('/etc/x'): Permission denied\n").unwrap();

    codex_loop()
        .arg("classify")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("PERMISSION_DENIED"));
}

#[test]
fn test_config_show_reads_project_settings() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join(".codex-loop")).unwrap();
    std::fs::write(
        temp.path().join(".codex-loop/settings.json"),
        r#"{"maxQualityCycles": 7, "verifyCommand": "make test"}"#,
    )
    .unwrap();

    codex_loop()
        .arg("--root")
        .arg(temp.path())
        .args(["config", "show", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"maxQualityCycles\": 7"))
        .stdout(predicate::str::contains("\"verifyCommand\": \"make test\""));
}

#[test]
fn test_config_show_rejects_malformed_settings() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join(".codex-loop")).unwrap();
    std::fs::write(temp.path().join(".codex-loop/settings.json"), "{ nope").unwrap();

    codex_loop()
        .arg("--root")
        .arg(temp.path())
        .args(["config", "show"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("Configuration error"));
}
