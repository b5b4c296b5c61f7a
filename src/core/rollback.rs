//! Rollback: restore the target from a verified backup.
//!
//! Runs as an explicit state machine so every transition is logged and the
//! failure point of an aborted rollback is unambiguous. Verification is
//! never skipped; restoring from a corrupt backup is worse than leaving a
//! broken deploy in place.

use std::fmt;
use std::io::{BufRead, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, warn};

use crate::adapters::{DatabaseDumper, HealthProbe, SyncRequest, TreeSynchronizer};
use crate::context::AppContext;
use crate::core::models::{BackupType, DUMP_FILE, StageReport};
use crate::core::{backup, sync, verifier};

/// Operator declined the confirmation prompt. Distinguished from real
/// failures so the CLI can exit as cancelled rather than failed.
#[derive(Debug, thiserror::Error)]
#[error("rollback not confirmed")]
pub struct NotConfirmed;

#[derive(Debug, Clone, Default)]
pub struct RollbackOptions {
    /// Backup to restore from. Defaults to the most recent file-bearing
    /// backup under the configured backup directory.
    pub backup: Option<PathBuf>,
    /// Verify the backup and stop; the target is never touched.
    pub verify_only: bool,
    /// Skip probing the target's health endpoint before restoring.
    pub skip_health_check: bool,
    /// Proceed without the interactive confirmation prompt. Set for
    /// automatic rollback, where there is no operator at a terminal.
    pub assume_yes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RollbackState {
    VerifyingBackup,
    CheckingTargetHealth,
    Confirming,
    BackingUpCurrent,
    Restoring,
    VerifyingRestore,
    Done,
}

impl fmt::Display for RollbackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RollbackState::VerifyingBackup => "verifying-backup",
            RollbackState::CheckingTargetHealth => "checking-target-health",
            RollbackState::Confirming => "confirming",
            RollbackState::BackingUpCurrent => "backing-up-current",
            RollbackState::Restoring => "restoring",
            RollbackState::VerifyingRestore => "verifying-restore",
            RollbackState::Done => "done",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug)]
pub struct RollbackOutcome {
    pub backup: PathBuf,
    /// Snapshot of the target taken just before restoring, when one was
    /// possible.
    pub pre_rollback_backup: Option<PathBuf>,
}

pub async fn run(
    ctx: &AppContext,
    target: &Path,
    options: &RollbackOptions,
    sync_engine: &dyn TreeSynchronizer,
    dumper: &dyn DatabaseDumper,
    probe: &dyn HealthProbe,
) -> Result<RollbackOutcome> {
    let backup_dir = resolve_backup(ctx, options)?;
    info!(backup = %backup_dir.display(), target = %target.display(), "Rollback starting");

    let mut pre_rollback_backup = None;
    let mut state = RollbackState::VerifyingBackup;

    while state != RollbackState::Done {
        info!(state = %state, "Rollback state");
        state = match state {
            RollbackState::VerifyingBackup => {
                let report = verifier::verify_backup(&backup_dir, ctx.config.backup_stale_days)?;
                report.log("rollback");
                if !report.passed() {
                    bail!(
                        "backup failed verification with {} error(s); refusing to restore from it",
                        report.error_count()
                    );
                }
                if options.verify_only {
                    info!("Verify-only: backup is restorable, stopping here");
                    return Ok(RollbackOutcome {
                        backup: backup_dir,
                        pre_rollback_backup: None,
                    });
                }
                RollbackState::CheckingTargetHealth
            }

            RollbackState::CheckingTargetHealth => {
                if !options.skip_health_check {
                    check_target_health(ctx, probe).await;
                }
                RollbackState::Confirming
            }

            RollbackState::Confirming => {
                if !options.assume_yes && !ctx.force && !ctx.dry_run() {
                    confirm(&backup_dir, target)?;
                }
                RollbackState::BackingUpCurrent
            }

            RollbackState::BackingUpCurrent => {
                if ctx.dry_run() {
                    info!("Dry-run: would snapshot the current target before restoring");
                } else if target.is_dir() {
                    // A failed restore must still be recoverable, so the
                    // broken state gets its own snapshot first.
                    let request = backup::BackupRequest {
                        backup_type: BackupType::Files,
                        source: Some(target.to_path_buf()),
                        include_caches: false,
                    };
                    let snapshot = backup::run(ctx, &request, sync_engine, dumper)
                        .await
                        .context("pre-rollback snapshot of the current target failed")?;
                    info!(snapshot = %snapshot.display(), "Current target snapshotted");
                    pre_rollback_backup = Some(snapshot);
                } else {
                    warn!("Target does not exist; nothing to snapshot before restore");
                }
                RollbackState::Restoring
            }

            RollbackState::Restoring => {
                if ctx.dry_run() {
                    info!(
                        backup = %backup_dir.display(),
                        "Dry-run: would restore payload into {}",
                        target.display()
                    );
                } else {
                    restore(ctx, &backup_dir, target, sync_engine).await?;
                }
                RollbackState::VerifyingRestore
            }

            RollbackState::VerifyingRestore => {
                if !ctx.dry_run() {
                    let report = verify_restored(ctx, target);
                    report.log("rollback");
                    if !report.passed() {
                        bail!(
                            "restored target failed verification with {} error(s)",
                            report.error_count()
                        );
                    }
                }
                if backup_dir.join(DUMP_FILE).is_file() {
                    info!(
                        dump = %backup_dir.join(DUMP_FILE).display(),
                        "Backup includes a database dump; restoring it is a manual follow-up (see RESTORE.md)"
                    );
                }
                RollbackState::Done
            }

            RollbackState::Done => RollbackState::Done,
        };
    }

    info!(backup = %backup_dir.display(), "Rollback complete");
    Ok(RollbackOutcome {
        backup: backup_dir,
        pre_rollback_backup,
    })
}

/// Explicit backup path, or the newest backup that carries a file payload.
fn resolve_backup(ctx: &AppContext, options: &RollbackOptions) -> Result<PathBuf> {
    if let Some(path) = &options.backup {
        if !path.is_dir() {
            bail!("backup directory not found: {}", path.display());
        }
        return Ok(path.clone());
    }
    let backups = backup::list_backups(&ctx.config.backup_directory)?;
    backups
        .into_iter()
        .find(|b| matches!(b.metadata.backup_type, BackupType::Files | BackupType::Full))
        .map(|b| b.path)
        .ok_or_else(|| {
            anyhow!(
                "no restorable backup found under {}",
                ctx.config.backup_directory.display()
            )
        })
}

/// Informational only. A dead health endpoint is the usual reason for a
/// rollback, so it must never block one.
async fn check_target_health(ctx: &AppContext, probe: &dyn HealthProbe) {
    let Some(base) = &ctx.env.public_url else {
        return;
    };
    let url = format!("{base}/server/health");
    let timeout = Duration::from_secs(ctx.config.probe_timeout_secs);
    match probe.get_status(&url, timeout).await {
        Ok(status) if (200..300).contains(&status) => {
            warn!(status, "Target currently reports healthy; rolling back anyway");
        }
        Ok(status) => info!(status, "Target health endpoint failing"),
        Err(e) => info!(error = %e, "Target health endpoint unreachable"),
    }
}

fn confirm(backup_dir: &Path, target: &Path) -> Result<()> {
    let mut stderr = std::io::stderr();
    write!(
        stderr,
        "Restore {} from {}? This replaces the current deployment. [y/N] ",
        target.display(),
        backup_dir.display()
    )?;
    stderr.flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    if !matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
        return Err(NotConfirmed.into());
    }
    Ok(())
}

/// Restore through the same staged promotion as a deploy: build the
/// restored tree next to the target, carry live preserved directories
/// forward, then swap.
async fn restore(
    ctx: &AppContext,
    backup_dir: &Path,
    target: &Path,
    sync_engine: &dyn TreeSynchronizer,
) -> Result<()> {
    let payload = verifier::payload_dir(backup_dir);
    let staging = sync::staging_dir(ctx, target)?;

    let req = SyncRequest::new(payload, staging.clone());
    sync_engine
        .sync(&req, &ctx.cancel)
        .await
        .context("restore copy into staging failed")?;

    sync::copy_forward_preserved(target, &staging, &ctx.config.preserve_directories)?;
    sync::apply_permissions(ctx, &staging)?;

    let retired = sync::promote(&staging, target)?;
    if let Some(old) = retired {
        info!(previous = %old.display(), "Replaced tree retained");
    }
    Ok(())
}

fn verify_restored(ctx: &AppContext, target: &Path) -> StageReport {
    let mut report = StageReport::new();
    if !target.is_dir() {
        report.push_error(format!("target missing after restore: {}", target.display()));
        return report;
    }
    for file in &ctx.config.essential_files {
        if !target.join(file).is_file() {
            report.push_error(format!("essential file missing after restore: {file}"));
        }
    }
    for dir in &ctx.config.preserve_directories {
        if !target.join(dir).is_dir() {
            report.push_warning(format!("preserved directory absent after restore: {dir}"));
        }
    }
    report
}
