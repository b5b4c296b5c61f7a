//! Backup verification.
//!
//! A backup is trustworthy when its metadata sidecar matches the directory
//! naming convention and the payload it describes. Verification never
//! mutates anything; it returns a report the caller decides on.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info};

use crate::core::fsops;
use crate::core::models::{
    BackupMetadata, BackupType, CHECKSUMS_FILE, DUMP_FILE, FILES_SUBDIR, METADATA_FILE,
    RESTORE_NOTES_FILE, StageReport, TAGS_FILE,
};

/// Marker every readable pg_dump output starts with.
const DUMP_HEADER: &str = "PostgreSQL database dump";

/// Cap on per-file mismatch detail in the report.
const MAX_REPORTED_MISMATCHES: usize = 10;

/// Locate the file-tree payload of a backup.
///
/// Backups written by this tool wrap the tree in a `files/` subdirectory;
/// captures made by older tooling may be the backup directory itself.
pub fn payload_dir(backup_dir: &Path) -> PathBuf {
    let wrapped = backup_dir.join(FILES_SUBDIR);
    if wrapped.is_dir() {
        wrapped
    } else {
        backup_dir.to_path_buf()
    }
}

fn is_sidecar(name: &str) -> bool {
    matches!(
        name,
        METADATA_FILE | TAGS_FILE | RESTORE_NOTES_FILE | CHECKSUMS_FILE | DUMP_FILE
    )
}

/// Verify a backup directory against its metadata sidecar.
///
/// Stale backups (older than `stale_days`) produce a warning, not an
/// error: the operator is expected to use judgment there.
pub fn verify_backup(backup_dir: &Path, stale_days: i64) -> Result<StageReport> {
    let mut report = StageReport::new();

    let metadata = match BackupMetadata::load(backup_dir) {
        Ok(m) => m,
        Err(e) => {
            report.push_error(format!("metadata sidecar missing or invalid: {e:#}"));
            return Ok(report);
        }
    };

    let dir_name = backup_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !dir_name.ends_with(&metadata.timestamp) {
        report.push_error(format!(
            "metadata timestamp {} does not match directory name {dir_name}",
            metadata.timestamp
        ));
    }

    match metadata.created_at() {
        Some(created) => {
            let age_days = (Utc::now() - created).num_days();
            if age_days > stale_days {
                report.push_warning(format!(
                    "backup is {age_days} days old (threshold {stale_days})"
                ));
            }
        }
        None => report.push_error(format!(
            "metadata timestamp '{}' is not in the expected format",
            metadata.timestamp
        )),
    }

    if matches!(metadata.backup_type, BackupType::Files | BackupType::Full) {
        verify_files(backup_dir, &metadata, &mut report)?;
    }
    if matches!(metadata.backup_type, BackupType::Database | BackupType::Full) {
        verify_dump(backup_dir, &mut report);
    }

    info!(
        backup = %backup_dir.display(),
        errors = report.error_count(),
        warnings = report.warning_count(),
        "Backup verification complete"
    );
    Ok(report)
}

fn verify_files(backup_dir: &Path, metadata: &BackupMetadata, report: &mut StageReport) -> Result<()> {
    let payload = payload_dir(backup_dir);
    if !payload.is_dir() {
        report.push_error("file backup has no payload directory".to_string());
        return Ok(());
    }

    let direct_capture = payload == backup_dir;
    let stats = if direct_capture {
        scan_excluding_sidecars(&payload)?
    } else {
        fsops::scan_tree(&payload)?
    };

    if stats.file_count == 0 {
        report.push_error("backup payload is empty".to_string());
        return Ok(());
    }
    if stats.zero_byte_files > 0 {
        report.push_warning(format!(
            "payload contains {} zero-byte file(s)",
            stats.zero_byte_files
        ));
    }

    // file_count recorded at creation must equal a fresh recursive scan.
    if let Some(recorded) = metadata.file_count
        && recorded != stats.file_count
    {
        report.push_error(format!(
            "file count mismatch: metadata records {recorded}, fresh scan found {}",
            stats.file_count
        ));
    }

    verify_checksums(backup_dir, &payload, report)?;
    Ok(())
}

fn scan_excluding_sidecars(payload: &Path) -> Result<fsops::TreeStats> {
    let mut stats = fsops::TreeStats::default();
    for entry in std::fs::read_dir(payload)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_sidecar(&name) {
            continue;
        }
        if path.is_dir() {
            let sub = fsops::scan_tree(&path)?;
            stats.file_count += sub.file_count;
            stats.total_bytes += sub.total_bytes;
            stats.zero_byte_files += sub.zero_byte_files;
        } else if path.is_file() {
            let len = path.metadata()?.len();
            stats.file_count += 1;
            stats.total_bytes += len;
            if len == 0 {
                stats.zero_byte_files += 1;
            }
        }
    }
    Ok(stats)
}

fn verify_checksums(backup_dir: &Path, payload: &Path, report: &mut StageReport) -> Result<()> {
    let manifest_path = backup_dir.join(CHECKSUMS_FILE);
    if !manifest_path.is_file() {
        debug!("No checksum manifest; skipping hash verification");
        return Ok(());
    }
    let manifest: std::collections::BTreeMap<String, String> =
        serde_json::from_str(&std::fs::read_to_string(&manifest_path)?)
            .context("invalid checksum manifest")?;

    let mut mismatches: Vec<String> = Vec::new();
    for (relative, expected) in &manifest {
        let path = payload.join(relative);
        if !path.is_file() {
            mismatches.push(format!("{relative}: missing from payload"));
            continue;
        }
        match hash_file(&path) {
            Ok(hash) if hash.to_hex().to_string() == *expected => {}
            Ok(_) => mismatches.push(format!("{relative}: hash mismatch")),
            Err(e) => mismatches.push(format!("{relative}: unreadable ({e})")),
        }
    }

    if !mismatches.is_empty() {
        for detail in mismatches.iter().take(MAX_REPORTED_MISMATCHES) {
            report.push_error(format!("checksum verification: {detail}"));
        }
        if mismatches.len() > MAX_REPORTED_MISMATCHES {
            report.push_error(format!(
                "checksum verification: ... and {} more",
                mismatches.len() - MAX_REPORTED_MISMATCHES
            ));
        }
    }
    Ok(())
}

fn verify_dump(backup_dir: &Path, report: &mut StageReport) {
    let dump_path = backup_dir.join(DUMP_FILE);
    let metadata = match std::fs::metadata(&dump_path) {
        Ok(m) => m,
        Err(_) => {
            report.push_error(format!("database dump missing: {}", dump_path.display()));
            return;
        }
    };
    if metadata.len() == 0 {
        report.push_error("database dump is empty".to_string());
        return;
    }

    // Only the head is needed to recognize a dump.
    let mut head = vec![0u8; 512];
    let read = std::fs::File::open(&dump_path)
        .and_then(|mut f| f.read(&mut head))
        .unwrap_or(0);
    head.truncate(read);
    let head = String::from_utf8_lossy(&head);
    if !head.trim_start().starts_with("--") || !head.contains(DUMP_HEADER) {
        report.push_error("database dump does not begin with a recognizable pg_dump header".to_string());
    }
}

/// Hash a file with BLAKE3, streaming in chunks to handle large files.
pub fn hash_file(path: &Path) -> Result<blake3::Hash> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = std::io::BufReader::with_capacity(128 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 128 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize())
}
