use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

use stagehand::adapters;
use stagehand::config::{DeployConfig, RuntimeEnv};
use stagehand::context::AppContext;
use stagehand::core::models::{BackupType, RunMode, format_timestamp};
use stagehand::core::orchestrator::{DeployOptions, Orchestrator};
use stagehand::core::{backup, extensions, preflight, rollback, sync, validate, verifier};
use stagehand::error::StageError;
use stagehand::logging::{self, LogConfig};

#[derive(Parser)]
#[command(
    name = "stagehand",
    version,
    about = "Safe deployment and rollback orchestrator for file-tree deploys"
)]
struct Cli {
    /// Path to the config file (default: stagehand.json if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Report what would be done without changing anything
    #[arg(long, global = true)]
    dry_run: bool,

    /// Verbose (debug-level) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Skip confirmation prompts and break live deploy locks
    #[arg(long, global = true)]
    force: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct TargetArgs {
    /// Deployment target directory (falls back to STAGEHAND_TARGET)
    #[arg(long)]
    target: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: pre-flight, backup, sync, extensions, validate
    Deploy {
        /// Source directory to deploy from
        #[arg(long)]
        source: PathBuf,
        #[command(flatten)]
        target: TargetArgs,
        /// Skip the backup stage (disables automatic rollback)
        #[arg(long)]
        skip_backup: bool,
        /// Skip pre-flight checks
        #[arg(long)]
        skip_checks: bool,
        /// Leave a failed deploy in place instead of rolling back
        #[arg(long)]
        no_rollback: bool,
        /// Sync directly into the live target instead of staging
        #[arg(long)]
        in_place: bool,
        /// Skip extension dependency installation
        #[arg(long)]
        no_install: bool,
    },

    /// Run pre-flight checks only
    Preflight {
        #[arg(long)]
        source: PathBuf,
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Take a backup without deploying
    Backup {
        /// What to capture
        #[arg(long = "type", value_enum, default_value = "files")]
        backup_type: BackupType,
        /// Directory to capture (required for files/full backups)
        #[arg(long)]
        source: Option<PathBuf>,
        /// Capture cache directories too
        #[arg(long)]
        include_caches: bool,
    },

    /// Sync the source tree into the target, nothing else
    Sync {
        #[arg(long)]
        source: PathBuf,
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        in_place: bool,
    },

    /// Deploy extensions only
    Extensions {
        /// Extensions source directory
        #[arg(long)]
        source: PathBuf,
        #[command(flatten)]
        target: TargetArgs,
        /// Skip dependency installation
        #[arg(long)]
        no_install: bool,
    },

    /// Validate the deployed target
    Validate {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Restore the target from a backup
    Rollback {
        /// Backup directory to restore from (default: newest file backup)
        #[arg(long)]
        backup: Option<PathBuf>,
        #[command(flatten)]
        target: TargetArgs,
        /// Verify the backup and stop without restoring
        #[arg(long)]
        verify_only: bool,
        /// Skip probing the target's health endpoint first
        #[arg(long)]
        skip_health_check: bool,
    },

    /// Manage existing backups
    Backups {
        #[command(subcommand)]
        command: BackupsCommand,
    },
}

#[derive(Subcommand)]
enum BackupsCommand {
    /// List backups, newest first
    List,
    /// Verify a backup's integrity
    Verify {
        /// Backup directory to verify
        backup: PathBuf,
    },
    /// Delete backups outside the retention policy
    Cleanup {
        #[arg(long, default_value_t = 5)]
        keep_recent: usize,
        /// Retention window for tagged backups, in days
        #[arg(long, default_value_t = 90)]
        tagged_days: i64,
        /// Retention window for untagged backups, in days
        #[arg(long, default_value_t = 30)]
        untagged_days: i64,
    },
    /// Tag a backup so it is retained longer
    Tag {
        /// Backup directory to tag
        backup: PathBuf,
        /// Tag to add
        tag: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let env = RuntimeEnv::from_env();
    let config = match DeployConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("stagehand: {e:#}");
            return ExitCode::from(StageError::Usage(e.to_string()).exit_code());
        }
    };

    let mode = if cli.dry_run || env.dry_run {
        RunMode::DryRun
    } else {
        RunMode::Live
    };
    let force = cli.force || env.force;

    let run_log = deploy_run_log(&cli.command, &config, mode);
    if let Err(e) = logging::init(
        LogConfig {
            json: cli.json_logs,
            verbose: cli.verbose,
        },
        run_log.as_deref(),
    ) {
        eprintln!("stagehand: failed to initialize logging: {e:#}");
        return ExitCode::from(StageError::Usage(e.to_string()).exit_code());
    }

    let ctx = AppContext::new(config, env, mode, force);
    if ctx.dry_run() {
        info!("Dry-run mode: no changes will be made");
    }

    match dispatch(&ctx, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Per-run log file for live deploys, under `<backup_directory>/logs/`.
fn deploy_run_log(command: &Commands, config: &DeployConfig, mode: RunMode) -> Option<PathBuf> {
    if !matches!(command, Commands::Deploy { .. }) || mode == RunMode::DryRun {
        return None;
    }
    Some(config.backup_directory.join("logs").join(format!(
        "deploy-{}-{}.log",
        format_timestamp(Utc::now()),
        std::process::id()
    )))
}

fn resolve_target(ctx: &AppContext, target: TargetArgs) -> Result<PathBuf, StageError> {
    target
        .target
        .or_else(|| ctx.env.default_target.clone())
        .ok_or_else(|| {
            StageError::Usage("no target given: pass --target or set STAGEHAND_TARGET".into())
        })
}

async fn dispatch(ctx: &AppContext, command: Commands) -> Result<(), StageError> {
    match command {
        Commands::Deploy {
            source,
            target,
            skip_backup,
            skip_checks,
            no_rollback,
            in_place,
            no_install,
        } => {
            let target = resolve_target(ctx, target)?;
            let orchestrator = Orchestrator::new(ctx.clone());
            orchestrator.install_interrupt_handler();
            let options = DeployOptions {
                source,
                target,
                skip_backup,
                skip_checks,
                no_rollback,
                in_place,
                no_install,
            };
            orchestrator.deploy(&options).await.map(|_| ())
        }

        Commands::Preflight { source, target } => {
            let target = resolve_target(ctx, target)?;
            let dumper = adapters::database_dumper();
            let probe = adapters::health_probe();
            let report = preflight::run(
                ctx,
                &source,
                &target,
                &preflight::PreflightOptions::default(),
                dumper.as_ref(),
                probe.as_ref(),
            )
            .await
            .map_err(|e| StageError::Usage(format!("{e:#}")))?;
            report.log("preflight");
            if report.passed() {
                info!("All pre-flight checks passed");
                Ok(())
            } else {
                Err(StageError::Preflight {
                    failed: report.error_count(),
                })
            }
        }

        Commands::Backup {
            backup_type,
            source,
            include_caches,
        } => {
            let request = backup::BackupRequest {
                backup_type,
                source,
                include_caches,
            };
            let sync_engine = adapters::synchronizer();
            let dumper = adapters::database_dumper();
            let path = backup::run(ctx, &request, sync_engine.as_ref(), dumper.as_ref())
                .await
                .map_err(StageError::Backup)?;
            println!("{}", path.display());
            Ok(())
        }

        Commands::Sync {
            source,
            target,
            in_place,
        } => {
            let target = resolve_target(ctx, target)?;
            let sync_engine = adapters::synchronizer();
            sync::run(
                ctx,
                &source,
                &target,
                sync_engine.as_ref(),
                &sync::SyncOptions { in_place },
            )
            .await
            .map_err(StageError::Deploy)
        }

        Commands::Extensions {
            source,
            target,
            no_install,
        } => {
            let target = resolve_target(ctx, target)?;
            let sync_engine = adapters::synchronizer();
            let report = extensions::run(
                ctx,
                &source,
                &target.join("extensions"),
                sync_engine.as_ref(),
                &extensions::ExtensionOptions {
                    install: !no_install,
                },
            )
            .await
            .map_err(StageError::Deploy)?;
            report.log("extensions");
            if report.passed() {
                Ok(())
            } else {
                Err(StageError::Deploy(anyhow::anyhow!(
                    "{} extension(s) failed to deploy",
                    report.error_count()
                )))
            }
        }

        Commands::Validate { target } => {
            let target = resolve_target(ctx, target)?;
            let probe = adapters::health_probe();
            let report = validate::run(
                ctx,
                &target,
                &validate::ValidateOptions::default(),
                probe.as_ref(),
            )
            .await
            .map_err(|e| StageError::Usage(format!("{e:#}")))?;
            report.log("validate");
            if report.passed() {
                info!("Validation passed");
                Ok(())
            } else {
                Err(StageError::Validation {
                    issues: report.error_count(),
                })
            }
        }

        Commands::Rollback {
            backup,
            target,
            verify_only,
            skip_health_check,
        } => {
            let target = resolve_target(ctx, target)?;
            let options = rollback::RollbackOptions {
                backup,
                verify_only,
                skip_health_check,
                assume_yes: false,
            };
            let sync_engine = adapters::synchronizer();
            let dumper = adapters::database_dumper();
            let probe = adapters::health_probe();
            match rollback::run(
                ctx,
                &target,
                &options,
                sync_engine.as_ref(),
                dumper.as_ref(),
                probe.as_ref(),
            )
            .await
            {
                Ok(_) => Ok(()),
                Err(e) if e.is::<rollback::NotConfirmed>() => Err(StageError::Cancelled),
                Err(e) => Err(StageError::Rollback(e)),
            }
        }

        Commands::Backups { command } => backups_command(ctx, command),
    }
}

fn backups_command(ctx: &AppContext, command: BackupsCommand) -> Result<(), StageError> {
    let root = &ctx.config.backup_directory;
    match command {
        BackupsCommand::List => {
            let backups =
                backup::list_backups(root).map_err(|e| StageError::Usage(format!("{e:#}")))?;
            if backups.is_empty() {
                println!("no backups under {}", root.display());
                return Ok(());
            }
            for b in backups {
                let tags = if b.tags.is_empty() {
                    String::new()
                } else {
                    format!("  [{}]", b.tags.join(", "))
                };
                println!(
                    "{}  {}  files={}{}",
                    b.id(),
                    b.metadata.backup_type,
                    b.metadata
                        .file_count
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "-".into()),
                    tags
                );
            }
            Ok(())
        }

        BackupsCommand::Verify { backup } => {
            let report = verifier::verify_backup(&backup, ctx.config.backup_stale_days)
                .map_err(|e| StageError::Usage(format!("{e:#}")))?;
            report.log("verify");
            if report.passed() {
                info!(backup = %backup.display(), "Backup is restorable");
                Ok(())
            } else {
                Err(StageError::Validation {
                    issues: report.error_count(),
                })
            }
        }

        BackupsCommand::Cleanup {
            keep_recent,
            tagged_days,
            untagged_days,
        } => {
            let policy = backup::RetentionPolicy {
                keep_recent,
                tagged_days,
                untagged_days,
            };
            let deleted = backup::cleanup(root, &policy, ctx.dry_run())
                .map_err(StageError::Backup)?;
            if deleted.is_empty() {
                info!("No backups outside the retention policy");
            } else {
                info!(count = deleted.len(), "Backups removed by retention policy");
            }
            Ok(())
        }

        BackupsCommand::Tag { backup, tag } => {
            if !backup.is_dir() {
                return Err(StageError::Usage(format!(
                    "backup directory not found: {}",
                    backup.display()
                )));
            }
            if ctx.dry_run() {
                warn!(backup = %backup.display(), tag, "Dry-run: would tag backup");
                return Ok(());
            }
            backup::add_tag(&backup, &tag).map_err(StageError::Backup)?;
            info!(backup = %backup.display(), tag, "Backup tagged");
            Ok(())
        }
    }
}
