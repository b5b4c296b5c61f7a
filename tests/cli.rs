//! CLI surface tests: argument handling, exit codes, and the no-side-effects
//! guarantee for usage errors. These run the real binary with the real
//! adapters (native copy fallback when rsync is absent).

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::{TempDir, tempdir};

fn stagehand(work: &Path, backups: &Path) -> Command {
    let mut cmd = Command::cargo_bin("stagehand").unwrap();
    cmd.current_dir(work);
    // Isolate from the developer's environment.
    for var in [
        "STAGEHAND_TARGET",
        "STAGEHAND_DRY_RUN",
        "STAGEHAND_FORCE",
        "DB_HOST",
        "DB_DATABASE",
        "DB_USER",
        "PUBLIC_URL",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd.env("STAGEHAND_BACKUP_DIRECTORY", backups);
    cmd.env("STAGEHAND_MIN_FREE_SPACE_MIB", "0");
    cmd
}

struct World {
    temp: TempDir,
    source: PathBuf,
    target: PathBuf,
    backups: PathBuf,
}

fn world() -> World {
    let temp = tempdir().unwrap();
    let source = temp.path().join("checkout");
    let target = temp.path().join("live");
    let backups = temp.path().join("backups");

    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("package.json"), br#"{"name":"cms"}"#).unwrap();
    std::fs::write(source.join("index.js"), b"new").unwrap();

    std::fs::create_dir_all(target.join("uploads")).unwrap();
    std::fs::create_dir_all(target.join("data")).unwrap();
    std::fs::write(target.join("uploads/a.png"), b"keep").unwrap();
    std::fs::write(target.join("package.json"), br#"{"name":"cms"}"#).unwrap();
    std::fs::write(target.join("index.js"), b"old").unwrap();

    World {
        temp,
        source,
        target,
        backups,
    }
}

#[test]
fn no_subcommand_is_a_usage_error() {
    let w = world();
    stagehand(w.temp.path(), &w.backups)
        .assert()
        .failure()
        .code(2);
}

#[test]
fn deploy_with_missing_source_exits_2_and_mutates_nothing() {
    let w = world();
    stagehand(w.temp.path(), &w.backups)
        .args(["deploy", "--source", "does-not-exist", "--target"])
        .arg(&w.target)
        .assert()
        .failure()
        .code(2);

    assert_eq!(std::fs::read(w.target.join("index.js")).unwrap(), b"old");
    // The run log directory may exist, but no backup was taken.
    let took_backup = w.backups.is_dir()
        && std::fs::read_dir(&w.backups)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("files-"));
    assert!(!took_backup);
}

#[test]
fn deploy_without_target_exits_2() {
    let w = world();
    stagehand(w.temp.path(), &w.backups)
        .args(["deploy", "--source"])
        .arg(&w.source)
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("STAGEHAND_TARGET"));
}

#[test]
fn explicit_missing_config_exits_2() {
    let w = world();
    stagehand(w.temp.path(), &w.backups)
        .args(["--config", "nope.json", "backups", "list"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("config file not found"));
}

#[test]
fn full_deploy_succeeds_and_preserves_uploads() {
    let w = world();
    stagehand(w.temp.path(), &w.backups)
        .args(["deploy", "--no-install", "--source"])
        .arg(&w.source)
        .arg("--target")
        .arg(&w.target)
        .assert()
        .success();

    assert_eq!(std::fs::read(w.target.join("index.js")).unwrap(), b"new");
    assert_eq!(std::fs::read(w.target.join("uploads/a.png")).unwrap(), b"keep");
    // A pre-deploy backup and a non-empty run log were written.
    let run_log = std::fs::read_dir(w.backups.join("logs"))
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| e.file_name().to_string_lossy().starts_with("deploy-"))
        .unwrap();
    assert!(std::fs::metadata(run_log.path()).unwrap().len() > 0);
    let has_backup = std::fs::read_dir(&w.backups)
        .unwrap()
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().starts_with("files-"));
    assert!(has_backup);
}

#[test]
fn dry_run_deploy_changes_nothing() {
    let w = world();
    stagehand(w.temp.path(), &w.backups)
        .args(["--dry-run", "deploy", "--no-install", "--source"])
        .arg(&w.source)
        .arg("--target")
        .arg(&w.target)
        .assert()
        .success();

    assert_eq!(std::fs::read(w.target.join("index.js")).unwrap(), b"old");
    assert!(!w.backups.exists());
}

#[test]
fn backup_verify_rollback_round_trip() {
    let w = world();

    // Take a file backup of the live target.
    let output = stagehand(w.temp.path(), &w.backups)
        .args(["backup", "--type", "files", "--source"])
        .arg(&w.target)
        .output()
        .unwrap();
    assert!(output.status.success());
    let backup_path = String::from_utf8(output.stdout).unwrap().trim().to_string();
    assert!(Path::new(&backup_path).is_dir());

    stagehand(w.temp.path(), &w.backups)
        .args(["backups", "verify", &backup_path])
        .assert()
        .success();

    stagehand(w.temp.path(), &w.backups)
        .args(["backups", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("files-"));

    // Break the target, then restore it.
    std::fs::write(w.target.join("index.js"), b"corrupted").unwrap();
    stagehand(w.temp.path(), &w.backups)
        .args(["--force", "rollback", "--skip-health-check", "--backup"])
        .arg(&backup_path)
        .arg("--target")
        .arg(&w.target)
        .assert()
        .success();
    assert_eq!(std::fs::read(w.target.join("index.js")).unwrap(), b"old");
}

#[test]
fn rollback_declined_at_prompt_exits_3() {
    let w = world();
    let output = stagehand(w.temp.path(), &w.backups)
        .args(["backup", "--type", "files", "--source"])
        .arg(&w.target)
        .output()
        .unwrap();
    let backup_path = String::from_utf8(output.stdout).unwrap().trim().to_string();

    stagehand(w.temp.path(), &w.backups)
        .args(["rollback", "--skip-health-check", "--backup"])
        .arg(&backup_path)
        .arg("--target")
        .arg(&w.target)
        .write_stdin("n\n")
        .assert()
        .failure()
        .code(3);
    assert_eq!(std::fs::read(w.target.join("index.js")).unwrap(), b"old");
}

#[test]
fn verify_only_rollback_never_restores() {
    let w = world();
    let output = stagehand(w.temp.path(), &w.backups)
        .args(["backup", "--type", "files", "--source"])
        .arg(&w.target)
        .output()
        .unwrap();
    let backup_path = String::from_utf8(output.stdout).unwrap().trim().to_string();

    std::fs::write(w.target.join("index.js"), b"still broken").unwrap();
    stagehand(w.temp.path(), &w.backups)
        .args(["rollback", "--verify-only", "--backup"])
        .arg(&backup_path)
        .arg("--target")
        .arg(&w.target)
        .assert()
        .success();
    assert_eq!(
        std::fs::read(w.target.join("index.js")).unwrap(),
        b"still broken"
    );
}

#[test]
fn corrupt_backup_fails_verification() {
    let w = world();
    let output = stagehand(w.temp.path(), &w.backups)
        .args(["backup", "--type", "files", "--source"])
        .arg(&w.target)
        .output()
        .unwrap();
    let backup_path = String::from_utf8(output.stdout).unwrap().trim().to_string();

    // Tamper with the payload.
    std::fs::write(Path::new(&backup_path).join("files/index.js"), b"evil").unwrap();

    stagehand(w.temp.path(), &w.backups)
        .args(["backups", "verify", &backup_path])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn validate_reports_missing_essential_file() {
    let w = world();
    std::fs::remove_file(w.target.join("package.json")).unwrap();

    stagehand(w.temp.path(), &w.backups)
        .args(["validate", "--target"])
        .arg(&w.target)
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("essential file missing"));
}

#[test]
fn preflight_passes_on_sane_setup() {
    let w = world();
    stagehand(w.temp.path(), &w.backups)
        .args(["preflight", "--source"])
        .arg(&w.source)
        .arg("--target")
        .arg(&w.target)
        .assert()
        .success();
}

#[test]
fn backups_cleanup_dry_run_deletes_nothing() {
    let w = world();
    let output = stagehand(w.temp.path(), &w.backups)
        .args(["backup", "--type", "files", "--source"])
        .arg(&w.target)
        .output()
        .unwrap();
    let backup_path = String::from_utf8(output.stdout).unwrap().trim().to_string();

    stagehand(w.temp.path(), &w.backups)
        .args(["--dry-run", "backups", "cleanup", "--keep-recent", "0", "--untagged-days", "0"])
        .assert()
        .success();
    assert!(Path::new(&backup_path).is_dir());
}

#[test]
fn tag_then_list_shows_the_tag() {
    let w = world();
    let output = stagehand(w.temp.path(), &w.backups)
        .args(["backup", "--type", "files", "--source"])
        .arg(&w.target)
        .output()
        .unwrap();
    let backup_path = String::from_utf8(output.stdout).unwrap().trim().to_string();

    stagehand(w.temp.path(), &w.backups)
        .args(["backups", "tag", &backup_path, "pre-upgrade"])
        .assert()
        .success();

    stagehand(w.temp.path(), &w.backups)
        .args(["backups", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("pre-upgrade"));
}
