//! Backup stage: timestamped, self-describing snapshots taken before any
//! destructive operation, plus listing, tagging, and retention cleanup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::adapters::{DatabaseDumper, SyncRequest, TreeSynchronizer};
use crate::config::backup_denylist;
use crate::context::AppContext;
use crate::core::fsops;
use crate::core::models::{
    Backup, BackupMetadata, BackupType, CHECKSUMS_FILE, DUMP_FILE, FILES_SUBDIR,
    RESTORE_NOTES_FILE, format_timestamp, load_tags, save_tags,
};
use crate::core::verifier;

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub backup_type: BackupType,
    /// Directory to capture; required for `files` and `full`.
    pub source: Option<PathBuf>,
    /// Capture cache directories too (excluded by default).
    pub include_caches: bool,
}

/// Take a backup, returning the new backup directory.
///
/// Hard failures: unreadable source, empty file payload, empty database
/// dump. The stage must never report success for empty output.
pub async fn run(
    ctx: &AppContext,
    request: &BackupRequest,
    sync: &dyn TreeSynchronizer,
    dumper: &dyn DatabaseDumper,
) -> Result<PathBuf> {
    // Timestamps have one-second resolution; two backups in the same second
    // would collide on the directory name, so wait the second out.
    let (timestamp, backup_dir) = loop {
        let timestamp = format_timestamp(Utc::now());
        let dir = ctx
            .config
            .backup_directory
            .join(format!("{}-{}", request.backup_type, timestamp));
        if !dir.exists() {
            break (timestamp, dir);
        }
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    };

    let wants_files = matches!(request.backup_type, BackupType::Files | BackupType::Full);
    let wants_database = matches!(request.backup_type, BackupType::Database | BackupType::Full);

    let source = if wants_files {
        let source = request
            .source
            .as_deref()
            .ok_or_else(|| anyhow!("file backup requires a source directory"))?;
        if !source.is_dir() {
            bail!("backup source not readable: {}", source.display());
        }
        Some(source)
    } else {
        request.source.as_deref()
    };

    if wants_database && !ctx.env.database.is_configured() {
        bail!("database backup requested but no database credentials are configured");
    }

    if ctx.dry_run() {
        info!(
            backup = %backup_dir.display(),
            backup_type = %request.backup_type,
            "Dry-run: would create backup"
        );
        return Ok(backup_dir);
    }

    std::fs::create_dir_all(&ctx.config.backup_directory)
        .with_context(|| format!("failed to create {}", ctx.config.backup_directory.display()))?;
    std::fs::create_dir(&backup_dir)
        .with_context(|| format!("backup directory already exists: {}", backup_dir.display()))?;

    let result = populate(ctx, request, &backup_dir, &timestamp, source, sync, dumper).await;
    if result.is_err() {
        // Never leave a half-written snapshot that later verification could
        // mistake for a usable backup.
        if let Err(e) = std::fs::remove_dir_all(&backup_dir) {
            warn!(backup = %backup_dir.display(), error = %e, "Failed to remove partial backup");
        }
    }
    result?;

    info!(backup = %backup_dir.display(), "Backup complete");
    Ok(backup_dir)
}

async fn populate(
    ctx: &AppContext,
    request: &BackupRequest,
    backup_dir: &Path,
    timestamp: &str,
    source: Option<&Path>,
    sync: &dyn TreeSynchronizer,
    dumper: &dyn DatabaseDumper,
) -> Result<()> {
    let wants_files = matches!(request.backup_type, BackupType::Files | BackupType::Full);
    let wants_database = matches!(request.backup_type, BackupType::Database | BackupType::Full);

    let mut metadata = BackupMetadata {
        backup_type: request.backup_type,
        timestamp: timestamp.to_string(),
        created_by: format!("stagehand {}", env!("CARGO_PKG_VERSION")),
        source_path: source.map(Path::to_path_buf),
        file_count: None,
        source_size: None,
        database_host: None,
        database_name: None,
        backup_size_bytes: None,
        git_revision: None,
    };

    if wants_files {
        let source = source.ok_or_else(|| anyhow!("file backup requires a source directory"))?;
        let payload = backup_dir.join(FILES_SUBDIR);

        let mut excludes = backup_denylist();
        if request.include_caches {
            excludes.retain(|p| p != "cache/" && p != "thumbnails/");
        }

        let mut req = SyncRequest::new(source.to_path_buf(), payload.clone());
        req.excludes = excludes;
        sync.sync(&req, &ctx.cancel).await.context("file capture failed")?;

        let stats = fsops::scan_tree(&payload)?;
        if stats.file_count == 0 {
            bail!("backup captured zero files from {}", source.display());
        }
        if stats.zero_byte_files > 0 {
            // Individual empty files are legal; flag them for verification.
            warn!(
                zero_byte_files = stats.zero_byte_files,
                "Backup contains zero-byte files"
            );
        }
        metadata.file_count = Some(stats.file_count);
        metadata.source_size = Some(stats.total_bytes);

        write_checksums(backup_dir, &payload)?;
        metadata.git_revision = git_revision(source).await;
    }

    if wants_database {
        let dump_path = backup_dir.join(DUMP_FILE);
        let outcome = dumper
            .dump(&ctx.env.database, &dump_path, &ctx.cancel)
            .await
            .context("database dump failed")?;
        metadata.database_host = ctx.env.database.host.clone();
        metadata.database_name = ctx.env.database.database.clone();
        metadata.backup_size_bytes = Some(outcome.bytes);
        if metadata.git_revision.is_none()
            && let Some(source) = source
        {
            metadata.git_revision = git_revision(source).await;
        }
    }

    metadata.write(backup_dir)?;
    write_restore_notes(backup_dir, &metadata)?;
    Ok(())
}

/// Blake3 manifest of the payload, relative path -> hex digest.
fn write_checksums(backup_dir: &Path, payload: &Path) -> Result<()> {
    let mut manifest: BTreeMap<String, String> = BTreeMap::new();
    collect_hashes(payload, payload, &mut manifest)?;
    let path = backup_dir.join(CHECKSUMS_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(&manifest)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    debug!(files = manifest.len(), "Wrote checksum manifest");
    Ok(())
}

fn collect_hashes(
    root: &Path,
    current: &Path,
    manifest: &mut BTreeMap<String, String>,
) -> Result<()> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = path.symlink_metadata()?;
        if metadata.is_dir() {
            collect_hashes(root, &path, manifest)?;
        } else if metadata.is_file() {
            let relative = path.strip_prefix(root)?.to_string_lossy().into_owned();
            let hash = verifier::hash_file(&path)?;
            manifest.insert(relative, hash.to_hex().to_string());
        }
    }
    Ok(())
}

/// Current source-control revision of the captured tree, when available.
async fn git_revision(source: &Path) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(source)
        .args(["rev-parse", "HEAD"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let revision = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!revision.is_empty()).then_some(revision)
}

fn write_restore_notes(backup_dir: &Path, metadata: &BackupMetadata) -> Result<()> {
    let mut notes = String::from("# Restore instructions\n\n");
    notes.push_str(&format!(
        "Backup type: {}\nCreated: {}\n\n",
        metadata.backup_type, metadata.timestamp
    ));
    match metadata.backup_type {
        BackupType::Files | BackupType::Full => {
            notes.push_str(&format!(
                "## Files\n\nThe `{FILES_SUBDIR}/` directory holds the captured tree.\n\
                 Restore with:\n\n    stagehand rollback --backup {} --target <TARGET>\n\n",
                backup_dir.display()
            ));
        }
        BackupType::Database => {}
    }
    if matches!(metadata.backup_type, BackupType::Database | BackupType::Full) {
        notes.push_str(&format!(
            "## Database\n\nDatabase restore is a manual step and is never automated:\n\n    \
             psql -h {} -d {} -f {}/{DUMP_FILE}\n",
            metadata.database_host.as_deref().unwrap_or("<HOST>"),
            metadata.database_name.as_deref().unwrap_or("<DB>"),
            backup_dir.display()
        ));
    }
    std::fs::write(backup_dir.join(RESTORE_NOTES_FILE), notes)
        .context("failed to write restore notes")
}

/// All readable backups under the root, newest first. Unreadable entries
/// are logged and skipped.
pub fn list_backups(root: &Path) -> Result<Vec<Backup>> {
    let mut backups = Vec::new();
    if !root.is_dir() {
        return Ok(backups);
    }
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        match Backup::open(&path) {
            Ok(backup) => backups.push(backup),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable backup"),
        }
    }
    backups.sort_by(|a, b| b.metadata.timestamp.cmp(&a.metadata.timestamp));
    Ok(backups)
}

pub fn add_tag(backup_dir: &Path, tag: &str) -> Result<()> {
    let mut tags = load_tags(backup_dir);
    if !tags.iter().any(|t| t == tag) {
        tags.push(tag.to_string());
    }
    save_tags(backup_dir, &tags)
}

/// Retention policy: keep the N most recent, tagged backups within
/// `tagged_days`, untagged within `untagged_days`; everything else is
/// deleted.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub keep_recent: usize,
    pub tagged_days: i64,
    pub untagged_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_recent: 5,
            tagged_days: 90,
            untagged_days: 30,
        }
    }
}

/// Apply the retention policy, returning the backups that were (or in
/// dry-run mode would be) deleted.
pub fn cleanup(root: &Path, policy: &RetentionPolicy, dry_run: bool) -> Result<Vec<PathBuf>> {
    let backups = list_backups(root)?;
    let now = Utc::now();
    let mut deleted = Vec::new();

    for (index, backup) in backups.iter().enumerate() {
        if index < policy.keep_recent {
            continue;
        }
        let age_days = backup
            .metadata
            .created_at()
            .map(|t| (now - t).num_days())
            .unwrap_or(i64::MAX);
        let window = if backup.tags.is_empty() {
            policy.untagged_days
        } else {
            policy.tagged_days
        };
        if age_days <= window {
            continue;
        }

        if dry_run {
            info!(backup = %backup.path.display(), age_days, "Dry-run: would delete backup");
        } else {
            info!(backup = %backup.path.display(), age_days, "Deleting expired backup");
            std::fs::remove_dir_all(&backup.path)
                .with_context(|| format!("failed to delete {}", backup.path.display()))?;
        }
        deleted.push(backup.path.clone());
    }
    Ok(deleted)
}
