//! Deployment orchestrator: runs the fixed stage pipeline and owns the
//! policy decisions the stages themselves stay out of.
//!
//! Stage order is always pre-flight, backup, sync, extensions, validate.
//! The orchestrator is the only component that escalates a failed stage to
//! an automatic rollback, and the only one that installs the interrupt
//! handler.

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use tracing::{error, info, warn};

use crate::adapters::{self, DatabaseDumper, HealthProbe, TreeSynchronizer};
use crate::context::AppContext;
use crate::core::models::{BackupType, DeploymentRun, RunStatus};
use crate::core::{backup, extensions, preflight, rollback, sync, validate};
use crate::error::StageError;
use crate::lock::DeployLock;

#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub source: PathBuf,
    pub target: PathBuf,
    /// Skip the backup stage. Disables automatic rollback with it.
    pub skip_backup: bool,
    /// Skip pre-flight checks.
    pub skip_checks: bool,
    /// Keep the failed state in place instead of rolling back.
    pub no_rollback: bool,
    /// Sync directly into the live target instead of staging.
    pub in_place: bool,
    /// Skip extension dependency installation.
    pub no_install: bool,
}

pub struct Orchestrator {
    ctx: AppContext,
    sync: Box<dyn TreeSynchronizer>,
    dumper: Box<dyn DatabaseDumper>,
    probe: Box<dyn HealthProbe>,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            sync: adapters::synchronizer(),
            dumper: adapters::database_dumper(),
            probe: adapters::health_probe(),
        }
    }

    /// Construct with explicit adapters, for tests and simulation.
    pub fn with_adapters(
        ctx: AppContext,
        sync: Box<dyn TreeSynchronizer>,
        dumper: Box<dyn DatabaseDumper>,
        probe: Box<dyn HealthProbe>,
    ) -> Self {
        Self {
            ctx,
            sync,
            dumper,
            probe,
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// Cancel the run on the first interrupt; a second interrupt kills the
    /// process the usual way.
    pub fn install_interrupt_handler(&self) {
        let cancel = self.ctx.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; cancelling after the current operation");
                cancel.cancel();
            }
        });
    }

    pub async fn deploy(&self, options: &DeployOptions) -> Result<DeploymentRun, StageError> {
        if !options.source.is_dir() {
            return Err(StageError::Usage(format!(
                "source directory not found: {}",
                options.source.display()
            )));
        }

        let _lock = if self.ctx.dry_run() {
            None
        } else {
            Some(
                DeployLock::acquire(&options.target, self.ctx.force)
                    .map_err(StageError::Deploy)?,
            )
        };

        let mut run = DeploymentRun::new(
            options.source.clone(),
            options.target.clone(),
            self.ctx.mode,
        );
        info!(run = %run.id, source = %options.source.display(), target = %options.target.display(), "Deployment starting");

        if !options.skip_checks {
            let report = preflight::run(
                &self.ctx,
                &options.source,
                &options.target,
                &preflight::PreflightOptions::default(),
                self.dumper.as_ref(),
                self.probe.as_ref(),
            )
            .await
            .map_err(StageError::Deploy)?;
            report.log("preflight");
            if !report.passed() {
                run.status = RunStatus::Failed;
                return Err(StageError::Preflight {
                    failed: report.error_count(),
                });
            }
        } else {
            warn!("Pre-flight checks skipped");
        }
        self.check_cancelled(&mut run)?;

        if !options.skip_backup {
            run.backup = self.take_backup(&options.target).await?;
        } else {
            warn!("Backup skipped; automatic rollback is unavailable for this run");
        }
        self.check_cancelled(&mut run)?;

        let sync_options = sync::SyncOptions {
            in_place: options.in_place,
        };
        if let Err(e) = sync::run(
            &self.ctx,
            &options.source,
            &options.target,
            self.sync.as_ref(),
            &sync_options,
        )
        .await
        {
            return Err(self.fail(&mut run, options, StageError::Deploy(e)).await);
        }
        self.check_cancelled(&mut run)?;

        let ext_options = extensions::ExtensionOptions {
            install: !options.no_install,
        };
        match extensions::run(
            &self.ctx,
            &options.source.join("extensions"),
            &options.target.join("extensions"),
            self.sync.as_ref(),
            &ext_options,
        )
        .await
        {
            Ok(report) => {
                report.log("extensions");
                if !report.passed() {
                    let e = StageError::Deploy(anyhow!(
                        "{} extension(s) failed to deploy",
                        report.error_count()
                    ));
                    return Err(self.fail(&mut run, options, e).await);
                }
            }
            Err(e) => {
                return Err(self.fail(&mut run, options, StageError::Deploy(e)).await);
            }
        }
        self.check_cancelled(&mut run)?;

        let report = validate::run(
            &self.ctx,
            &options.target,
            &validate::ValidateOptions::default(),
            self.probe.as_ref(),
        )
        .await
        .map_err(StageError::Deploy)?;
        report.log("validate");
        if !report.passed() {
            let e = StageError::Validation {
                issues: report.error_count(),
            };
            return Err(self.fail(&mut run, options, e).await);
        }

        run.status = RunStatus::Succeeded;
        info!(run = %run.id, "Deployment succeeded");
        Ok(run)
    }

    /// Snapshot the current target before it is mutated. A first deploy has
    /// nothing to capture and proceeds without a snapshot.
    async fn take_backup(&self, target: &Path) -> Result<Option<PathBuf>, StageError> {
        if !target.is_dir() {
            warn!(
                target = %target.display(),
                "Target does not exist yet; skipping pre-deploy backup"
            );
            return Ok(None);
        }
        let backup_type = if self.ctx.env.database.is_configured() {
            BackupType::Full
        } else {
            BackupType::Files
        };
        let request = backup::BackupRequest {
            backup_type,
            source: Some(target.to_path_buf()),
            include_caches: false,
        };
        let path = backup::run(&self.ctx, &request, self.sync.as_ref(), self.dumper.as_ref())
            .await
            .map_err(StageError::Backup)?;
        Ok(Some(path))
    }

    fn check_cancelled(&self, run: &mut DeploymentRun) -> Result<(), StageError> {
        if self.ctx.cancel.is_cancelled() {
            run.status = RunStatus::Failed;
            return Err(StageError::Cancelled);
        }
        Ok(())
    }

    /// Escalate a failed stage: roll back automatically when a pre-deploy
    /// snapshot exists and rollback was not disabled, otherwise surface the
    /// stage failure as-is.
    async fn fail(
        &self,
        run: &mut DeploymentRun,
        options: &DeployOptions,
        cause: StageError,
    ) -> StageError {
        run.status = RunStatus::Failed;
        error!(run = %run.id, "Deployment stage failed: {cause}");

        if self.ctx.dry_run() || options.no_rollback {
            return cause;
        }
        let Some(backup_dir) = &run.backup else {
            warn!("No pre-deploy backup available; leaving failed state in place");
            return cause;
        };

        info!(backup = %backup_dir.display(), "Attempting automatic rollback");
        let rb_options = rollback::RollbackOptions {
            backup: Some(backup_dir.clone()),
            verify_only: false,
            skip_health_check: true,
            assume_yes: true,
        };
        match rollback::run(
            &self.ctx,
            &options.target,
            &rb_options,
            self.sync.as_ref(),
            self.dumper.as_ref(),
            self.probe.as_ref(),
        )
        .await
        {
            Ok(outcome) => {
                run.status = RunStatus::RolledBack;
                StageError::RolledBack {
                    backup: outcome
                        .backup
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| outcome.backup.display().to_string()),
                }
            }
            Err(e) => StageError::Rollback(e.context(format!("after stage failure: {cause}"))),
        }
    }
}
