//! Sync stage: replicate the source tree into the target without ever
//! touching preserved data directories.
//!
//! Default path is staged: the new tree is built in a fresh staging
//! directory, preserved directories are carried forward from the live
//! target, and the cutover is a pair of renames. A mid-sync crash leaves
//! the live target untouched because it is never written in place.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::adapters::{SyncRequest, TreeSynchronizer};
use crate::config::ExclusionPolicy;
use crate::context::AppContext;
use crate::core::fsops;
use crate::core::models::format_timestamp;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Sync directly into the live target with delete semantics instead of
    /// staging. Partial state on interruption is an accepted risk of this
    /// mode.
    pub in_place: bool,
}

pub async fn run(
    ctx: &AppContext,
    source: &Path,
    target: &Path,
    sync: &dyn TreeSynchronizer,
    options: &SyncOptions,
) -> Result<()> {
    if !source.is_dir() {
        bail!("source directory not found: {}", source.display());
    }
    let policy = ctx.config.exclusion_policy();

    if ctx.dry_run() {
        info!(
            source = %source.display(),
            target = %target.display(),
            engine = sync.name(),
            "Dry-run: planning sync"
        );
        let mut req = base_request(source, target, &policy);
        req.dry_run = true;
        req.delete_extraneous = options.in_place;
        sync.sync(&req, &ctx.cancel).await?;
        if !options.in_place {
            info!(
                "Dry-run: would promote staging into {} and retain the previous tree",
                target.display()
            );
        }
        return Ok(());
    }

    if options.in_place {
        warn!(
            "In-place sync: an interruption can leave the target partially updated; \
             staged mode avoids this"
        );
        let mut req = base_request(source, target, &policy);
        req.delete_extraneous = true;
        sync.sync(&req, &ctx.cancel).await.context("in-place sync failed")?;
        apply_permissions(ctx, target)?;
        info!(target = %target.display(), "In-place sync complete");
        return Ok(());
    }

    let staging = staging_dir(ctx, target)?;
    info!(staging = %staging.display(), engine = sync.name(), "Syncing into staging directory");

    let result = stage_and_promote(ctx, source, target, &staging, sync, &policy).await;
    if result.is_err() {
        // The live target was never written; the staging tree is kept for
        // inspection.
        warn!(
            staging = %staging.display(),
            "Staged sync failed before promotion; target is unchanged"
        );
    }
    result
}

async fn stage_and_promote(
    ctx: &AppContext,
    source: &Path,
    target: &Path,
    staging: &Path,
    sync: &dyn TreeSynchronizer,
    policy: &ExclusionPolicy,
) -> Result<()> {
    let req = base_request(source, staging, policy);
    sync.sync(&req, &ctx.cancel).await.context("sync into staging failed")?;

    copy_forward_preserved(target, staging, &policy.preserve_directories)?;
    apply_permissions(ctx, staging)?;

    if ctx.cancel.is_cancelled() {
        bail!("sync cancelled before promotion");
    }

    let retired = promote(staging, target)?;
    match retired {
        Some(old) => info!(
            target = %target.display(),
            previous = %old.display(),
            "Promoted staging; previous tree retained"
        ),
        None => info!(target = %target.display(), "Promoted staging into new target"),
    }
    Ok(())
}

fn base_request(source: &Path, destination: &Path, policy: &ExclusionPolicy) -> SyncRequest {
    let mut req = SyncRequest::new(source.to_path_buf(), destination.to_path_buf());
    req.excludes = policy.exclude_patterns.clone();
    req.includes = policy.include_patterns.clone();
    req.extra_options = policy.rsync_options.clone();
    req
}

/// Fresh staging directory next to the target (same filesystem, so the
/// final rename stays atomic), unless the config overrides it.
pub(crate) fn staging_dir(ctx: &AppContext, target: &Path) -> Result<PathBuf> {
    let staging = match &ctx.config.atomic_deployment.staging_directory {
        Some(dir) => dir.clone(),
        None => {
            let name = target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "target".into());
            let parent = target.parent().unwrap_or_else(|| Path::new("."));
            parent.join(format!(
                ".{name}-staging-{}-{}",
                format_timestamp(Utc::now()),
                std::process::id()
            ))
        }
    };
    if staging.exists() {
        warn!(staging = %staging.display(), "Removing leftover staging directory");
        std::fs::remove_dir_all(&staging)
            .with_context(|| format!("failed to remove {}", staging.display()))?;
    }
    std::fs::create_dir_all(&staging)
        .with_context(|| format!("failed to create {}", staging.display()))?;
    Ok(staging)
}

/// Carry the live target's preserved directories into the staged tree, so
/// promotion never loses user data. The staged copy is replaced, not
/// merged: a merge would resurrect files that were deleted from the live
/// tree whenever the staged tree (a restored backup payload, say) still
/// holds them.
pub(crate) fn copy_forward_preserved(
    target: &Path,
    staging: &Path,
    preserve: &[String],
) -> Result<()> {
    for dir in preserve {
        let current = target.join(dir);
        if !current.is_dir() {
            continue;
        }
        let staged = staging.join(dir);
        if staged.exists() {
            std::fs::remove_dir_all(&staged)
                .with_context(|| format!("failed to clear staged copy of {dir}"))?;
        }
        debug!(directory = dir, "Carrying preserved directory forward");
        fsops::copy_tree(&current, &staged)
            .with_context(|| format!("failed to preserve {dir}"))?;
    }
    Ok(())
}

/// Near-atomic cutover: rename the live target aside, rename staging into
/// place. Returns the retired tree's path. The old tree is retained, not
/// deleted, for manual inspection.
pub(crate) fn promote(staging: &Path, target: &Path) -> Result<Option<PathBuf>> {
    let retired = if target.exists() {
        let old = target.with_file_name(format!(
            "{}.old-{}",
            target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "target".into()),
            format_timestamp(Utc::now())
        ));
        std::fs::rename(target, &old).with_context(|| {
            format!(
                "failed to retire current target {} (target is unchanged)",
                target.display()
            )
        })?;
        Some(old)
    } else {
        None
    };

    if let Err(e) = std::fs::rename(staging, target) {
        // Roll the first rename back so the boundary stays intact.
        if let Some(old) = &retired {
            let _ = std::fs::rename(old, target);
        }
        return Err(e).with_context(|| {
            format!("failed to promote staging into {}", target.display())
        });
    }
    Ok(retired)
}

/// Normalize ownership-free permission bits after a sync: configured modes
/// for files and directories, executable bit for deployment scripts.
pub(crate) fn apply_permissions(ctx: &AppContext, root: &Path) -> Result<()> {
    let file_mode = ctx.config.permissions.file_mode_bits()?;
    let dir_mode = ctx.config.permissions.directory_mode_bits()?;
    let preserve = &ctx.config.preserve_directories;

    apply_recursive(root, root, file_mode, dir_mode, preserve)?;
    Ok(())
}

fn apply_recursive(
    root: &Path,
    current: &Path,
    file_mode: u32,
    dir_mode: u32,
    preserve: &[String],
) -> Result<()> {
    for entry in std::fs::read_dir(current)
        .with_context(|| format!("failed to read {}", current.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if let Ok(relative) = path.strip_prefix(root)
            && preserve
                .iter()
                .any(|p| relative.starts_with(p.trim_end_matches('/')))
        {
            // Preserved subtrees keep whatever modes they had.
            continue;
        }
        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        if metadata.is_dir() {
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(dir_mode));
            apply_recursive(root, &path, file_mode, dir_mode, preserve)?;
        } else if metadata.is_file() {
            let mode = if path.extension().is_some_and(|e| e == "sh") {
                file_mode | 0o111
            } else {
                file_mode
            };
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::simulated::SimulatedSynchronizer;
    use crate::config::{DeployConfig, RuntimeEnv};
    use crate::core::models::RunMode;
    use tempfile::tempdir;

    fn ctx(mode: RunMode) -> AppContext {
        let config = DeployConfig {
            exclude_patterns: vec!["*.log".into()],
            preserve_directories: vec!["uploads".into()],
            ..Default::default()
        };
        AppContext::new(config, RuntimeEnv::default(), mode, false)
    }

    fn seed(source: &Path) {
        std::fs::create_dir_all(source).unwrap();
        std::fs::write(source.join("app.js"), b"new code").unwrap();
        std::fs::write(source.join("deploy.sh"), b"#!/bin/sh\n").unwrap();
        std::fs::write(source.join("app.log"), b"noise").unwrap();
    }

    #[tokio::test]
    async fn staged_sync_replaces_code_and_preserves_uploads() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("src");
        let target = temp.path().join("live");
        seed(&source);
        std::fs::create_dir_all(target.join("uploads")).unwrap();
        std::fs::write(target.join("uploads/img.png"), b"user upload").unwrap();
        std::fs::write(target.join("old.js"), b"old code").unwrap();

        let ctx = ctx(RunMode::Live);
        let sync = SimulatedSynchronizer::new();
        run(&ctx, &source, &target, &sync, &SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(std::fs::read(target.join("app.js")).unwrap(), b"new code");
        // Excluded pattern absent, preserved bytes identical, stale code gone.
        assert!(!target.join("app.log").exists());
        assert_eq!(
            std::fs::read(target.join("uploads/img.png")).unwrap(),
            b"user upload"
        );
        assert!(!target.join("old.js").exists());

        // Previous tree retained for inspection.
        let retained = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("live.old-"));
        assert!(retained);
    }

    #[tokio::test]
    async fn deploy_scripts_become_executable() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("src");
        let target = temp.path().join("live");
        seed(&source);

        let ctx = ctx(RunMode::Live);
        run(
            &ctx,
            &source,
            &target,
            &SimulatedSynchronizer::new(),
            &SyncOptions::default(),
        )
        .await
        .unwrap();

        let mode = std::fs::metadata(target.join("deploy.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111);
        let plain = std::fs::metadata(target.join("app.js"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(plain & 0o777, 0o644);
    }

    #[tokio::test]
    async fn dry_run_leaves_target_untouched() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("src");
        let target = temp.path().join("live");
        seed(&source);
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("existing.js"), b"keep me").unwrap();

        let ctx = ctx(RunMode::DryRun);
        run(
            &ctx,
            &source,
            &target,
            &SimulatedSynchronizer::new(),
            &SyncOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(target.join("existing.js")).unwrap(), b"keep me");
        assert!(!target.join("app.js").exists());
        assert_eq!(std::fs::read_dir(&target).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn failed_staged_sync_leaves_target_intact() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("src");
        let target = temp.path().join("live");
        seed(&source);
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("current.js"), b"live").unwrap();

        let ctx = ctx(RunMode::Live);
        let failing = SimulatedSynchronizer::failing("copy exploded");
        let result = run(&ctx, &source, &target, &failing, &SyncOptions::default()).await;

        assert!(result.is_err());
        assert_eq!(std::fs::read(target.join("current.js")).unwrap(), b"live");
    }

    #[tokio::test]
    async fn in_place_sync_deletes_extraneous_but_not_preserved() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("src");
        let target = temp.path().join("live");
        seed(&source);
        std::fs::create_dir_all(target.join("uploads")).unwrap();
        std::fs::write(target.join("uploads/keep.bin"), b"data").unwrap();
        std::fs::write(target.join("stale.js"), b"old").unwrap();

        let ctx = ctx(RunMode::Live);
        run(
            &ctx,
            &source,
            &target,
            &SimulatedSynchronizer::new(),
            &SyncOptions { in_place: true },
        )
        .await
        .unwrap();

        assert!(target.join("app.js").exists());
        assert!(!target.join("stale.js").exists());
        assert_eq!(std::fs::read(target.join("uploads/keep.bin")).unwrap(), b"data");
    }

    #[test]
    fn promote_rolls_back_first_rename_on_failure() {
        // Promoting onto a target whose staging vanished must restore the
        // retired tree.
        let temp = tempdir().unwrap();
        let staging = temp.path().join("staging");
        let target = temp.path().join("live");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("f"), b"x").unwrap();

        // staging does not exist: second rename fails
        let result = promote(&staging, &target);
        assert!(result.is_err());
        assert!(target.join("f").exists());
    }
}
