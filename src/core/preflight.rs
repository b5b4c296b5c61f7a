//! Read-only environment validation performed before any mutating stage.
//!
//! Every check logs a pass/fail line and failures are aggregated, so the
//! operator sees the full picture in one run instead of fixing problems one
//! at a time.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use nix::unistd::{AccessFlags, access};
use tracing::{info, warn};

use crate::adapters::{DatabaseDumper, HealthProbe, tool_on_path};
use crate::context::AppContext;
use crate::core::fsops;
use crate::core::models::StageReport;

/// How many files of the source tree get an actual read probe.
const READ_SAMPLE_LIMIT: usize = 25;

/// Check categories, each independently toggleable. All default to enabled.
#[derive(Debug, Clone, Copy)]
pub struct PreflightOptions {
    pub tools: bool,
    pub disk_space: bool,
    pub permissions: bool,
    pub database: bool,
    pub services: bool,
}

impl Default for PreflightOptions {
    fn default() -> Self {
        Self {
            tools: true,
            disk_space: true,
            permissions: true,
            database: true,
            services: true,
        }
    }
}

fn log_check(name: &str, passed: bool, detail: &str) {
    if passed {
        info!(check = name, status = "pass", "{detail}");
    } else {
        warn!(check = name, status = "fail", "{detail}");
    }
}

pub async fn run(
    ctx: &AppContext,
    source: &Path,
    target: &Path,
    options: &PreflightOptions,
    dumper: &dyn DatabaseDumper,
    probe: &dyn HealthProbe,
) -> Result<StageReport> {
    let mut report = StageReport::new();

    if options.tools {
        check_tools(ctx, &mut report);
    }
    if options.disk_space {
        check_disk_space(ctx, target, &mut report);
    }
    if options.permissions {
        check_permissions(source, target, &mut report);
    }
    if options.database {
        check_database(ctx, dumper, &mut report).await;
    }
    if options.services {
        check_services(ctx, probe, &mut report).await;
    }

    info!(
        failed = report.error_count(),
        warnings = report.warning_count(),
        "Pre-flight complete"
    );
    Ok(report)
}

fn check_tools(ctx: &AppContext, report: &mut StageReport) {
    let rsync = tool_on_path("rsync");
    log_check("tool:rsync", rsync, "rsync on PATH");
    if !rsync {
        // Not fatal: the native copy fallback covers sync and file backups.
        report.push_warning("rsync not found on PATH; native copy fallback will be used");
    }

    if ctx.env.database.is_configured() {
        for tool in ["pg_dump", "psql"] {
            let present = tool_on_path(tool);
            log_check(&format!("tool:{tool}"), present, "required for database backup");
            if !present {
                report.push_error(format!(
                    "{tool} not found on PATH but database credentials are configured"
                ));
            }
        }
    } else {
        info!(check = "tool:pg_dump", status = "skip", "no database configured");
    }
}

fn check_disk_space(ctx: &AppContext, target: &Path, report: &mut StageReport) {
    let minimum = ctx.config.min_free_space_mib * 1024 * 1024;

    for (label, path) in [
        ("target", target),
        ("backup", ctx.config.backup_directory.as_path()),
    ] {
        match free_space_bytes(path) {
            Ok(free) => {
                let ok = free >= minimum;
                log_check(
                    &format!("disk:{label}"),
                    ok,
                    &format!("{} MiB free on {}", free / (1024 * 1024), path.display()),
                );
                if !ok {
                    report.push_error(format!(
                        "insufficient disk space for {label} filesystem: {} MiB free, {} MiB required",
                        free / (1024 * 1024),
                        ctx.config.min_free_space_mib
                    ));
                }
            }
            Err(e) => {
                log_check(&format!("disk:{label}"), false, "statvfs failed");
                report.push_error(format!(
                    "could not determine free space for {}: {e}",
                    path.display()
                ));
            }
        }
    }
}

/// Free bytes on the filesystem holding `path` (or its nearest existing
/// ancestor, for paths created later in the run).
pub fn free_space_bytes(path: &Path) -> Result<u64> {
    let existing = fsops::nearest_existing_ancestor(path)?;
    let stat = nix::sys::statvfs::statvfs(&existing)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

fn check_permissions(source: &Path, target: &Path, report: &mut StageReport) {
    if !source.is_dir() {
        log_check("perm:source", false, "source directory missing");
        report.push_error(format!("source directory not found: {}", source.display()));
    } else if access(source, AccessFlags::R_OK | AccessFlags::X_OK).is_err() {
        log_check("perm:source", false, "source not readable");
        report.push_error(format!("source directory not readable: {}", source.display()));
    } else {
        match fsops::sample_readable(source, READ_SAMPLE_LIMIT) {
            Ok((checked, unreadable)) if unreadable.is_empty() => {
                log_check(
                    "perm:source",
                    true,
                    &format!("sampled {checked} files, all readable"),
                );
            }
            Ok((checked, unreadable)) => {
                log_check(
                    "perm:source",
                    false,
                    &format!("{} of {checked} sampled files unreadable", unreadable.len()),
                );
                for path in unreadable.iter().take(5) {
                    report.push_error(format!("unreadable source file: {}", path.display()));
                }
            }
            Err(e) => {
                log_check("perm:source", false, "sampling failed");
                report.push_error(format!("failed to sample source files: {e}"));
            }
        }
    }

    // Target may not exist yet; its closest ancestor must be writable so we
    // can create it.
    let probe = if target.exists() {
        target.to_path_buf()
    } else {
        match fsops::nearest_existing_ancestor(target) {
            Ok(p) => p,
            Err(e) => {
                report.push_error(format!("target has no existing ancestor: {e}"));
                return;
            }
        }
    };
    let writable = access(&probe, AccessFlags::W_OK).is_ok();
    log_check(
        "perm:target",
        writable,
        &format!("{} writable", probe.display()),
    );
    if !writable {
        report.push_error(format!("target not writable: {}", probe.display()));
    }
}

async fn check_database(ctx: &AppContext, dumper: &dyn DatabaseDumper, report: &mut StageReport) {
    if !ctx.env.database.is_configured() {
        // Absence of credentials is a skipped check, never a failure.
        info!(check = "database", status = "skip", "no credentials in environment");
        return;
    }

    let timeout = Duration::from_secs(ctx.config.probe_timeout_secs.min(5));
    match dumper.check_reachable(&ctx.env.database, timeout).await {
        Ok(()) => log_check("database", true, "reachable"),
        Err(e) => {
            log_check("database", false, "unreachable");
            report.push_error(format!("database unreachable: {e}"));
        }
    }
}

/// A warning, not an error: a service that is already down is frequently
/// the thing the deploy is meant to fix.
async fn check_services(ctx: &AppContext, probe: &dyn HealthProbe, report: &mut StageReport) {
    let Some(base) = &ctx.env.public_url else {
        info!(check = "services", status = "skip", "no public URL configured");
        return;
    };
    let url = format!("{base}/server/health");
    let timeout = Duration::from_secs(ctx.config.probe_timeout_secs.min(5));
    match probe.get_status(&url, timeout).await {
        Ok(status) if (200..300).contains(&status) => {
            log_check("services", true, "service responding");
        }
        Ok(status) => {
            log_check("services", false, "service not healthy");
            report.push_warning(format!("service returned HTTP {status} before deploy"));
        }
        Err(e) => {
            log_check("services", false, "service unreachable");
            report.push_warning(format!("service unreachable before deploy: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::simulated::{SimulatedDumper, SimulatedProbe};
    use crate::config::{DatabaseEnv, DeployConfig, RuntimeEnv};
    use crate::context::AppContext;
    use crate::core::models::RunMode;
    use tempfile::tempdir;

    fn ctx_with(config: DeployConfig, env: RuntimeEnv) -> AppContext {
        AppContext::new(config, env, RunMode::Live, false)
    }

    #[tokio::test]
    async fn passes_on_sane_directories() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("src");
        let target = temp.path().join("dst");
        std::fs::create_dir(&source).unwrap();
        std::fs::write(source.join("index.js"), b"x").unwrap();

        let config = DeployConfig {
            backup_directory: temp.path().join("backups"),
            min_free_space_mib: 0,
            ..Default::default()
        };
        let ctx = ctx_with(config, RuntimeEnv::default());

        let report = run(
            &ctx,
            &source,
            &target,
            &PreflightOptions::default(),
            &SimulatedDumper::ok(),
            &SimulatedProbe::healthy(),
        )
        .await
        .unwrap();
        assert_eq!(report.error_count(), 0);
    }

    #[tokio::test]
    async fn missing_source_fails() {
        let temp = tempdir().unwrap();
        let config = DeployConfig {
            backup_directory: temp.path().join("backups"),
            min_free_space_mib: 0,
            ..Default::default()
        };
        let ctx = ctx_with(config, RuntimeEnv::default());

        let report = run(
            &ctx,
            &temp.path().join("nope"),
            &temp.path().join("dst"),
            &PreflightOptions::default(),
            &SimulatedDumper::ok(),
            &SimulatedProbe::healthy(),
        )
        .await
        .unwrap();
        assert!(report.error_count() >= 1);
    }

    #[tokio::test]
    async fn unreachable_database_fails_when_configured() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("src");
        std::fs::create_dir(&source).unwrap();

        let config = DeployConfig {
            backup_directory: temp.path().join("backups"),
            min_free_space_mib: 0,
            ..Default::default()
        };
        let env = RuntimeEnv {
            database: DatabaseEnv {
                host: Some("db".into()),
                port: 5432,
                database: Some("app".into()),
                user: Some("u".into()),
                password: None,
            },
            ..Default::default()
        };
        let ctx = ctx_with(config, env);

        let options = PreflightOptions {
            tools: false,
            ..Default::default()
        };
        let failing = SimulatedDumper {
            fail: true,
            empty: false,
        };
        let report = run(
            &ctx,
            &source,
            &temp.path().join("dst"),
            &options,
            &failing,
            &SimulatedProbe::healthy(),
        )
        .await
        .unwrap();
        assert_eq!(report.error_count(), 1);
    }

    #[tokio::test]
    async fn absent_credentials_skip_database_check() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("src");
        std::fs::create_dir(&source).unwrap();

        let config = DeployConfig {
            backup_directory: temp.path().join("backups"),
            min_free_space_mib: 0,
            ..Default::default()
        };
        let ctx = ctx_with(config, RuntimeEnv::default());

        let options = PreflightOptions {
            tools: false,
            ..Default::default()
        };
        // Would fail if called; absence of credentials must skip it.
        let failing = SimulatedDumper {
            fail: true,
            empty: false,
        };
        let report = run(
            &ctx,
            &source,
            &temp.path().join("dst"),
            &options,
            &failing,
            &SimulatedProbe::down(),
        )
        .await
        .unwrap();
        assert_eq!(report.error_count(), 0);
    }

    #[tokio::test]
    async fn unreachable_service_is_a_warning_not_an_error() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("src");
        std::fs::create_dir(&source).unwrap();

        let config = DeployConfig {
            backup_directory: temp.path().join("backups"),
            min_free_space_mib: 0,
            ..Default::default()
        };
        let env = RuntimeEnv {
            public_url: Some("http://localhost:8055".into()),
            ..Default::default()
        };
        let ctx = ctx_with(config, env);

        let options = PreflightOptions {
            tools: false,
            ..Default::default()
        };
        let report = run(
            &ctx,
            &source,
            &temp.path().join("dst"),
            &options,
            &SimulatedDumper::ok(),
            &SimulatedProbe::down(),
        )
        .await
        .unwrap();
        assert_eq!(report.error_count(), 0);
        assert_eq!(report.warning_count(), 1);
    }

    #[test]
    fn free_space_is_nonzero_for_tempdir() {
        let temp = tempdir().unwrap();
        assert!(free_space_bytes(temp.path()).unwrap() > 0);
    }
}
