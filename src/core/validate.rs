//! Post-deploy validation: confirm the target is structurally sound and,
//! when a public URL is configured, that the service answers.
//!
//! Validation never mutates the target. All findings are collected into a
//! single report so the operator sees every problem from one run.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use nix::unistd::{AccessFlags, access};
use tracing::info;

use crate::adapters::HealthProbe;
use crate::context::AppContext;
use crate::core::fsops;
use crate::core::models::StageReport;

const READ_SAMPLE_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct ValidateOptions {
    /// Preserved data directories intact and readable.
    pub data: bool,
    /// Essential files present in the target.
    pub files: bool,
    /// Extension manifests parseable and built.
    pub extensions: bool,
    /// HTTP liveness against the configured public URL.
    pub api: bool,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            data: true,
            files: true,
            extensions: true,
            api: true,
        }
    }
}

pub async fn run(
    ctx: &AppContext,
    target: &Path,
    options: &ValidateOptions,
    probe: &dyn HealthProbe,
) -> Result<StageReport> {
    let mut report = StageReport::new();

    if !target.is_dir() {
        report.push_error(format!("target directory not found: {}", target.display()));
        return Ok(report);
    }

    if options.data {
        check_preserved_data(ctx, target, &mut report);
    }
    if options.files {
        check_essential_files(ctx, target, &mut report);
    }
    if options.extensions {
        check_extensions(target, &mut report);
    }
    if options.api {
        check_api(ctx, probe, &mut report).await;
    }

    info!(
        failed = report.error_count(),
        warnings = report.warning_count(),
        "Validation complete"
    );
    Ok(report)
}

fn check_preserved_data(ctx: &AppContext, target: &Path, report: &mut StageReport) {
    for dir in &ctx.config.preserve_directories {
        let path = target.join(dir);
        if !path.is_dir() {
            report.push_error(format!("preserved directory missing after deploy: {dir}"));
            continue;
        }
        if access(&path, AccessFlags::R_OK | AccessFlags::W_OK).is_err() {
            report.push_error(format!("preserved directory not read-writable: {dir}"));
            continue;
        }
        match fsops::sample_readable(&path, READ_SAMPLE_LIMIT) {
            Ok((_, unreadable)) if unreadable.is_empty() => {
                info!(directory = dir, "Preserved data intact");
            }
            Ok((checked, unreadable)) => {
                report.push_error(format!(
                    "{} of {checked} sampled files in {dir} are unreadable",
                    unreadable.len()
                ));
            }
            Err(e) => {
                report.push_error(format!("failed to inspect preserved directory {dir}: {e}"));
            }
        }
    }
}

fn check_essential_files(ctx: &AppContext, target: &Path, report: &mut StageReport) {
    for file in &ctx.config.essential_files {
        let path = target.join(file);
        if path.is_file() {
            info!(file = file.as_str(), "Essential file present");
        } else {
            report.push_error(format!("essential file missing: {file}"));
        }
    }
}

/// Look over deployed extensions: an unparseable manifest is corruption, a
/// source tree with no build output is suspicious but may be intentional.
fn check_extensions(target: &Path, report: &mut StageReport) {
    let root = target.join("extensions");
    if !root.is_dir() {
        return;
    }
    let entries = match std::fs::read_dir(&root) {
        Ok(e) => e,
        Err(e) => {
            report.push_error(format!("cannot read extensions directory: {e}"));
            return;
        }
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.path().is_dir() {
            continue;
        }
        let dir = entry.path();
        let manifest = dir.join("package.json");
        match std::fs::read_to_string(&manifest) {
            Ok(content) => {
                if serde_json::from_str::<serde_json::Value>(&content).is_err() {
                    report.push_error(format!("extension '{name}' has an invalid package.json"));
                }
            }
            Err(_) => {
                report.push_error(format!("extension '{name}' is missing package.json"));
            }
        }
        if dir.join("src").is_dir() && !dir.join("dist").is_dir() {
            report.push_warning(format!(
                "extension '{name}' has source but no build output"
            ));
        }
    }
}

async fn check_api(ctx: &AppContext, probe: &dyn HealthProbe, report: &mut StageReport) {
    let Some(base) = &ctx.env.public_url else {
        // Without a URL there is nothing to probe; structural checks stand
        // on their own.
        info!(check = "api", status = "skip", "no public URL configured");
        return;
    };
    let timeout = Duration::from_secs(ctx.config.probe_timeout_secs);

    let health_url = format!("{base}/server/health");
    match probe.get_status(&health_url, timeout).await {
        Ok(status) if (200..300).contains(&status) => {
            info!(url = %health_url, status, "Health endpoint ok");
        }
        Ok(status) => {
            report.push_error(format!("health endpoint returned HTTP {status}"));
        }
        Err(e) => {
            report.push_error(format!("health endpoint unreachable: {e}"));
        }
    }

    // The info endpoint requires the app to be fully booted; a failure here
    // with a healthy /server/health usually means startup is still running.
    let info_url = format!("{base}/server/info");
    match probe.get_status(&info_url, timeout).await {
        Ok(status) if (200..300).contains(&status) => {
            info!(url = %info_url, status, "Info endpoint ok");
        }
        Ok(status) => {
            report.push_warning(format!("info endpoint returned HTTP {status}"));
        }
        Err(e) => {
            report.push_warning(format!("info endpoint unreachable: {e}"));
        }
    }
}
