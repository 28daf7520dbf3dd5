use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

fn foreman_cmd(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("foreman"));
    cmd.current_dir(dir);
    cmd
}

fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        out.status.success(),
        "git {args:?}: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

fn init_repo(dir: &Path) {
    git(dir, &["init", "--initial-branch=main"]);
    git(dir, &["config", "user.name", "test"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    std::fs::write(dir.join("README.md"), "seed\n").expect("seed file");
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", "initial"]);
}

#[test]
fn status_works_on_a_fresh_directory() {
    let dir = TempDir::new().expect("tempdir");
    foreman_cmd(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(contains("0 pending"));
}

#[test]
fn status_json_is_machine_readable() {
    let dir = TempDir::new().expect("tempdir");
    let output = foreman_cmd(dir.path())
        .args(["status", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let parsed: serde_json::Value = serde_json::from_slice(&output).expect("valid JSON");
    assert_eq!(parsed["pending"], 0);
    assert!(parsed["state"]["version"].is_number());
}

#[test]
fn checkpoint_create_list_restore_roundtrip() {
    let dir = TempDir::new().expect("tempdir");
    init_repo(dir.path());
    std::fs::write(dir.path().join("work.txt"), "draft\n").expect("write");

    foreman_cmd(dir.path())
        .args(["checkpoint", "create", "--message", "before edits"])
        .assert()
        .success()
        .stdout(contains("created"));

    foreman_cmd(dir.path())
        .args(["checkpoint", "list"])
        .assert()
        .success()
        .stdout(contains("before edits"));

    std::fs::write(dir.path().join("work.txt"), "clobbered\n").expect("write");
    git(dir.path(), &["add", "-A"]);
    git(dir.path(), &["commit", "-m", "bad edit"]);

    foreman_cmd(dir.path())
        .args(["checkpoint", "restore", "latest"])
        .assert()
        .success()
        .stdout(contains("restored"));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("work.txt")).expect("read"),
        "draft\n"
    );
}

#[test]
fn restore_unknown_checkpoint_fails_cleanly() {
    let dir = TempDir::new().expect("tempdir");
    init_repo(dir.path());
    foreman_cmd(dir.path())
        .args(["checkpoint", "restore", "cp-missing"])
        .assert()
        .failure()
        .stderr(contains("checkpoint not found"));
}

#[test]
fn provenance_verify_passes_on_empty_ledger() {
    let dir = TempDir::new().expect("tempdir");
    foreman_cmd(dir.path())
        .args(["provenance", "verify"])
        .assert()
        .success()
        .stdout(contains("ledger intact"));
}

#[test]
fn run_dry_run_lists_ready_tasks_only() {
    let dir = TempDir::new().expect("tempdir");
    init_repo(dir.path());
    std::fs::write(
        dir.path().join("tasks.json"),
        r#"[
            {"id": "A", "title": "first"},
            {"id": "B", "title": "second", "depends_on": ["A"]}
        ]"#,
    )
    .expect("tasks");

    foreman_cmd(dir.path())
        .args(["run", "--dry-run"])
        .assert()
        .success()
        .stdout(contains("A").and(contains("B").not()));
}

#[test]
fn run_merges_a_trivial_task() {
    let dir = TempDir::new().expect("tempdir");
    init_repo(dir.path());
    std::fs::write(
        dir.path().join("tasks.json"),
        r#"[{"id": "A", "title": "no-op"}]"#,
    )
    .expect("tasks");

    foreman_cmd(dir.path())
        .args(["run", "--generate-cmd", "true", "--verify-cmd", "true"])
        .assert()
        .success()
        .stdout(contains("1 merged"));

    let tasks = std::fs::read_to_string(dir.path().join("tasks.json")).expect("tasks");
    assert!(tasks.contains("merged"));
}

#[test]
fn state_reset_writes_a_fresh_state() {
    let dir = TempDir::new().expect("tempdir");
    foreman_cmd(dir.path())
        .args(["state", "reset"])
        .assert()
        .success()
        .stdout(contains("state reset"));
    assert!(dir.path().join(".foreman").join("state.json").exists());
}
