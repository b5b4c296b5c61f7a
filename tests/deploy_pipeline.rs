//! End-to-end pipeline tests across stage boundaries, using the simulated
//! adapters so no external tools are required.

use std::path::{Path, PathBuf};

use tempfile::{TempDir, tempdir};

use stagehand::adapters::simulated::{SimulatedDumper, SimulatedProbe, SimulatedSynchronizer};
use stagehand::config::{DeployConfig, RuntimeEnv};
use stagehand::context::AppContext;
use stagehand::core::models::{BackupType, RunMode, RunStatus};
use stagehand::core::orchestrator::{DeployOptions, Orchestrator};
use stagehand::core::{backup, rollback, verifier};

struct World {
    _temp: TempDir,
    source: PathBuf,
    target: PathBuf,
    backups: PathBuf,
}

fn world() -> World {
    let temp = tempdir().unwrap();
    let source = temp.path().join("checkout");
    let target = temp.path().join("live");
    let backups = temp.path().join("backups");

    std::fs::create_dir_all(source.join("extensions/hook-audit/dist")).unwrap();
    std::fs::write(source.join("package.json"), br#"{"name":"cms","version":"2.0.0"}"#).unwrap();
    std::fs::write(source.join("index.js"), b"release 2").unwrap();
    std::fs::write(source.join("deploy.sh"), b"#!/bin/sh\n").unwrap();
    std::fs::write(
        source.join("extensions/hook-audit/package.json"),
        br#"{"name":"hook-audit"}"#,
    )
    .unwrap();
    std::fs::write(source.join("extensions/hook-audit/dist/index.js"), b"hook").unwrap();

    std::fs::create_dir_all(target.join("uploads/2026")).unwrap();
    std::fs::create_dir_all(target.join("data")).unwrap();
    std::fs::write(target.join("uploads/2026/img.png"), b"irreplaceable").unwrap();
    std::fs::write(target.join("data/settings.db"), b"state").unwrap();
    std::fs::write(target.join("package.json"), br#"{"name":"cms","version":"1.0.0"}"#).unwrap();
    std::fs::write(target.join("index.js"), b"release 1").unwrap();

    World {
        _temp: temp,
        source,
        target,
        backups,
    }
}

fn context(w: &World, mode: RunMode) -> AppContext {
    let config = DeployConfig {
        backup_directory: w.backups.clone(),
        min_free_space_mib: 0,
        ..Default::default()
    };
    AppContext::new(config, RuntimeEnv::default(), mode, false)
}

fn orchestrator(ctx: AppContext) -> Orchestrator {
    Orchestrator::with_adapters(
        ctx,
        Box::new(SimulatedSynchronizer::new()),
        Box::new(SimulatedDumper::ok()),
        Box::new(SimulatedProbe::healthy()),
    )
}

fn deploy_options(w: &World) -> DeployOptions {
    DeployOptions {
        source: w.source.clone(),
        target: w.target.clone(),
        skip_backup: false,
        skip_checks: false,
        no_rollback: false,
        in_place: false,
        no_install: true,
    }
}

#[tokio::test]
async fn deploy_then_rollback_restores_previous_release() {
    let w = world();

    // Deploy release 2 over release 1.
    let run = orchestrator(context(&w, RunMode::Live))
        .deploy(&deploy_options(&w))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(std::fs::read(w.target.join("index.js")).unwrap(), b"release 2");
    assert!(w.target.join("extensions/hook-audit/dist/index.js").exists());

    // User data survived the deploy untouched.
    assert_eq!(
        std::fs::read(w.target.join("uploads/2026/img.png")).unwrap(),
        b"irreplaceable"
    );
    assert_eq!(
        std::fs::read(w.target.join("data/settings.db")).unwrap(),
        b"state"
    );

    // User data written after the deploy must survive the rollback too.
    std::fs::write(w.target.join("uploads/2026/new.png"), b"post-deploy upload").unwrap();

    let ctx = context(&w, RunMode::Live);
    let options = rollback::RollbackOptions {
        backup: run.backup.clone(),
        verify_only: false,
        skip_health_check: true,
        assume_yes: true,
    };
    rollback::run(
        &ctx,
        &w.target,
        &options,
        &SimulatedSynchronizer::new(),
        &SimulatedDumper::ok(),
        &SimulatedProbe::down(),
    )
    .await
    .unwrap();

    assert_eq!(std::fs::read(w.target.join("index.js")).unwrap(), b"release 1");
    assert_eq!(
        std::fs::read(w.target.join("uploads/2026/new.png")).unwrap(),
        b"post-deploy upload"
    );
}

#[tokio::test]
async fn pre_deploy_backup_passes_verification() {
    let w = world();

    let run = orchestrator(context(&w, RunMode::Live))
        .deploy(&deploy_options(&w))
        .await
        .unwrap();
    let backup_dir = run.backup.unwrap();

    let report = verifier::verify_backup(&backup_dir, 30).unwrap();
    assert_eq!(report.error_count(), 0);

    // Payload matches the pre-deploy target byte for byte.
    let payload = verifier::payload_dir(&backup_dir);
    assert_eq!(std::fs::read(payload.join("index.js")).unwrap(), b"release 1");
    assert_eq!(
        std::fs::read(payload.join("uploads/2026/img.png")).unwrap(),
        b"irreplaceable"
    );
}

#[tokio::test]
async fn dry_run_is_idempotent_and_side_effect_free() {
    let w = world();
    let snapshot = |root: &Path| -> Vec<(String, Vec<u8>)> {
        fn walk(root: &Path, current: &Path, out: &mut Vec<(String, Vec<u8>)>) {
            for entry in std::fs::read_dir(current).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    walk(root, &path, out);
                } else {
                    let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
                    out.push((rel, std::fs::read(&path).unwrap()));
                }
            }
        }
        let mut out = Vec::new();
        walk(root, root, &mut out);
        out.sort();
        out
    };
    let before = snapshot(&w.target);

    for _ in 0..2 {
        let run = orchestrator(context(&w, RunMode::DryRun))
            .deploy(&deploy_options(&w))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
    }

    assert_eq!(snapshot(&w.target), before);
    assert!(!w.backups.exists());
}

#[tokio::test]
async fn repeated_deploys_each_take_their_own_backup() {
    let w = world();

    orchestrator(context(&w, RunMode::Live))
        .deploy(&deploy_options(&w))
        .await
        .unwrap();
    std::fs::write(w.source.join("index.js"), b"release 3").unwrap();
    orchestrator(context(&w, RunMode::Live))
        .deploy(&deploy_options(&w))
        .await
        .unwrap();

    let backups = backup::list_backups(&w.backups).unwrap();
    assert_eq!(backups.len(), 2);
    assert_eq!(std::fs::read(w.target.join("index.js")).unwrap(), b"release 3");

    // Newest backup captured release 2, the state just before the last
    // deploy.
    let newest = verifier::payload_dir(&backups[0].path);
    assert_eq!(std::fs::read(newest.join("index.js")).unwrap(), b"release 2");
}

#[tokio::test]
async fn file_backup_round_trips_through_restore() {
    let w = world();

    // Denylisted content must not travel through the backup.
    std::fs::create_dir_all(w.target.join("node_modules/left-pad")).unwrap();
    std::fs::write(w.target.join("node_modules/left-pad/index.js"), b"dep").unwrap();
    std::fs::create_dir_all(w.target.join("cache")).unwrap();
    std::fs::write(w.target.join("cache/tmp.bin"), b"scratch").unwrap();

    let ctx = context(&w, RunMode::Live);
    let sync = SimulatedSynchronizer::new();
    let dumper = SimulatedDumper::ok();
    let request = backup::BackupRequest {
        backup_type: BackupType::Files,
        source: Some(w.target.clone()),
        include_caches: false,
    };
    let backup_dir = backup::run(&ctx, &request, &sync, &dumper).await.unwrap();

    // Restore the backup into a directory that does not exist yet.
    let restored = w.target.with_file_name("restored");
    let options = rollback::RollbackOptions {
        backup: Some(backup_dir),
        verify_only: false,
        skip_health_check: true,
        assume_yes: true,
    };
    rollback::run(
        &ctx,
        &restored,
        &options,
        &sync,
        &dumper,
        &SimulatedProbe::down(),
    )
    .await
    .unwrap();

    let snapshot = |root: &Path| -> Vec<(String, Vec<u8>)> {
        fn walk(root: &Path, current: &Path, out: &mut Vec<(String, Vec<u8>)>) {
            for entry in std::fs::read_dir(current).unwrap() {
                let path = entry.unwrap().path();
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
                if rel.starts_with("node_modules") || rel.starts_with("cache") {
                    continue;
                }
                if path.is_dir() {
                    walk(root, &path, out);
                } else {
                    out.push((rel, std::fs::read(&path).unwrap()));
                }
            }
        }
        let mut out = Vec::new();
        walk(root, root, &mut out);
        out.sort();
        out
    };
    assert_eq!(snapshot(&restored), snapshot(&w.target));
    assert!(!restored.join("node_modules").exists());
    assert!(!restored.join("cache").exists());
}

#[tokio::test]
async fn first_deploy_into_empty_target_works_without_backup() {
    let w = world();
    std::fs::remove_dir_all(&w.target).unwrap();

    let err = orchestrator(context(&w, RunMode::Live))
        .deploy(&deploy_options(&w))
        .await
        .unwrap_err();

    // No target yet: the snapshot is skipped and the code lands, but
    // validation flags the missing preserved directories because a fresh
    // sync never creates them. The operator seeds uploads/ and data/ and
    // re-runs.
    assert_eq!(err.exit_code(), 2);
    assert_eq!(std::fs::read(w.target.join("index.js")).unwrap(), b"release 2");
    assert!(!w.backups.exists());
}
