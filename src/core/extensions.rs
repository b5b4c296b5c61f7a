//! Extension deployment: copy CMS plugin directories into the target and
//! install their runtime dependencies.
//!
//! Each plugin is handled independently. A broken manifest or failed
//! install is recorded as an issue and the remaining plugins still deploy,
//! so one bad extension never blocks the rest.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::adapters::{SyncRequest, TreeSynchronizer};
use crate::context::AppContext;
use crate::core::models::StageReport;

#[derive(Debug, Clone, Copy)]
pub struct ExtensionOptions {
    /// Run the package-manager install step after syncing each plugin.
    pub install: bool,
}

impl Default for ExtensionOptions {
    fn default() -> Self {
        Self { install: true }
    }
}

pub async fn run(
    ctx: &AppContext,
    extensions_source: &Path,
    extensions_target: &Path,
    sync: &dyn TreeSynchronizer,
    options: &ExtensionOptions,
) -> Result<StageReport> {
    let mut report = StageReport::new();
    let config = &ctx.config.extension_sync;

    if !config.enabled {
        info!("Extension sync disabled in config; skipping");
        return Ok(report);
    }
    if !extensions_source.is_dir() {
        info!(
            path = %extensions_source.display(),
            "No extensions directory in source; nothing to deploy"
        );
        return Ok(report);
    }

    let plugins = discover_plugins(extensions_source)?;
    if plugins.is_empty() {
        info!("Extensions directory contains no plugins");
        return Ok(report);
    }
    info!(count = plugins.len(), "Deploying extensions");

    for name in &plugins {
        let plugin_source = extensions_source.join(name);
        let plugin_target = extensions_target.join(name);

        if let Err(message) = check_manifest(&plugin_source) {
            report.push_error(format!("extension '{name}': {message}"));
            continue;
        }

        if let Err(e) = sync_plugin(ctx, &plugin_source, &plugin_target, sync).await {
            report.push_error(format!("extension '{name}': sync failed: {e:#}"));
            continue;
        }
        debug!(extension = name, "Extension synced");

        if options.install && !ctx.dry_run() {
            if let Err(e) = install_dependencies(&plugin_target).await {
                report.push_error(format!("extension '{name}': install failed: {e:#}"));
            }
        }
    }

    info!(
        deployed = plugins.len() - report.error_count(),
        failed = report.error_count(),
        "Extension deployment complete"
    );
    Ok(report)
}

/// Plugin candidates are the non-hidden subdirectories of the extensions
/// root, sorted for stable ordering.
fn discover_plugins(root: &Path) -> Result<Vec<String>> {
    let mut plugins = Vec::new();
    for entry in std::fs::read_dir(root)
        .with_context(|| format!("failed to read {}", root.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        match entry.file_type() {
            Ok(t) if t.is_dir() => plugins.push(name),
            _ => {}
        }
    }
    plugins.sort();
    Ok(plugins)
}

/// A plugin must carry a parseable `package.json` to be deployable.
fn check_manifest(plugin_dir: &Path) -> std::result::Result<(), String> {
    let manifest = plugin_dir.join("package.json");
    let content = std::fs::read_to_string(&manifest)
        .map_err(|_| "missing package.json".to_string())?;
    serde_json::from_str::<Value>(&content)
        .map(|_| ())
        .map_err(|e| format!("invalid package.json: {e}"))
}

async fn sync_plugin(
    ctx: &AppContext,
    source: &Path,
    target: &Path,
    sync: &dyn TreeSynchronizer,
) -> Result<()> {
    let config = &ctx.config.extension_sync;
    let mut excludes = config.exclude_patterns.clone();
    if !config.include_source && !excludes.contains(&"src/".to_string()) {
        excludes.push("src/".into());
    }
    if !config.include_dist {
        excludes.push("dist/".into());
    }

    let mut req = SyncRequest::new(source.to_path_buf(), target.to_path_buf());
    req.excludes = excludes;
    req.delete_extraneous = true;
    req.dry_run = ctx.dry_run();
    sync.sync(&req, &ctx.cancel).await?;
    Ok(())
}

/// Pick the install command from the lockfile that shipped with the plugin.
/// Lockfile-driven installs are reproducible; `npm install` is the fallback
/// for plugins without one.
fn install_command(plugin_dir: &Path) -> (&'static str, &'static [&'static str]) {
    if plugin_dir.join("package-lock.json").is_file() {
        ("npm", &["ci", "--omit=dev"])
    } else if plugin_dir.join("yarn.lock").is_file() {
        ("yarn", &["install", "--frozen-lockfile", "--production"])
    } else {
        ("npm", &["install", "--omit=dev"])
    }
}

async fn install_dependencies(plugin_dir: &Path) -> Result<()> {
    let (program, args) = install_command(plugin_dir);
    info!(
        extension = %plugin_dir.display(),
        command = program,
        "Installing extension dependencies"
    );

    let output = Command::new(program)
        .args(args)
        .current_dir(plugin_dir)
        .output()
        .await
        .with_context(|| format!("failed to launch {program}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(
            extension = %plugin_dir.display(),
            status = %output.status,
            "Dependency install failed"
        );
        anyhow::bail!(
            "{program} exited with {}: {}",
            output.status,
            stderr.lines().last().unwrap_or("no output")
        );
    }
    Ok(())
}
