//! Native recursive-copy fallback for hosts without rsync.
//!
//! Unlike rsync, the copy routine has no live exclusion support, so
//! exclusions are applied post-hoc: the whole tree is copied, then paths
//! matching the exclude patterns are deleted from the destination. The end
//! state matches what rsync would have produced.

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{SyncOutcome, SyncRequest, TreeSynchronizer};
use crate::config::patterns_match;
use crate::core::fsops;

pub struct NativeCopySynchronizer;

#[async_trait]
impl TreeSynchronizer for NativeCopySynchronizer {
    fn name(&self) -> &'static str {
        "native-copy"
    }

    async fn sync(&self, req: &SyncRequest, cancel: &CancellationToken) -> Result<SyncOutcome> {
        let req = req.clone();
        let cancel = cancel.clone();

        // Blocking filesystem work off the async runtime.
        tokio::task::spawn_blocking(move || run_sync(&req, &cancel)).await?
    }
}

fn run_sync(req: &SyncRequest, cancel: &CancellationToken) -> Result<SyncOutcome> {
    if cancel.is_cancelled() {
        bail!("sync cancelled by operator");
    }

    if req.includes.is_some() {
        bail!("include-only mode requires rsync; the native fallback does not support it");
    }

    if req.dry_run {
        let stats = fsops::scan_tree(&req.source)?;
        info!(
            files = stats.file_count,
            bytes = stats.total_bytes,
            destination = %req.destination.display(),
            "Dry-run: would copy tree and then delete excluded paths"
        );
        return Ok(SyncOutcome {
            files_transferred: stats.file_count,
            bytes_transferred: stats.total_bytes,
        });
    }

    let stats = fsops::copy_tree(&req.source, &req.destination)?;

    if cancel.is_cancelled() {
        bail!("sync cancelled by operator");
    }

    if req.delete_extraneous {
        delete_extraneous(&req.source, &req.destination, &req.excludes)?;
    }

    // Post-hoc exclusion pass: the copy above did not filter.
    let removed = remove_excluded(&req.source, &req.destination, &req.excludes)?;
    debug!(removed = removed, "Removed excluded paths after copy");

    Ok(SyncOutcome {
        files_transferred: stats.file_count,
        bytes_transferred: stats.total_bytes,
    })
}

/// Delete destination paths matching any exclude pattern. Only paths that
/// also exist in the source are candidates: those are the ones the copy
/// brought over. Anything the destination already held (preserved data
/// during an in-place sync) is left alone, matching rsync's behavior.
/// Returns the number of top-level paths removed.
fn remove_excluded(source: &Path, root: &Path, patterns: &[String]) -> Result<u64> {
    let mut removed = 0u64;
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let relative = match path.strip_prefix(root) {
                Ok(r) => r.to_path_buf(),
                Err(_) => continue,
            };
            if patterns_match(patterns, &relative) && source.join(&relative).exists() {
                let result = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                if result.is_ok() {
                    removed += 1;
                    debug!(path = %path.display(), "Removed excluded path");
                }
            } else if path.is_dir() {
                stack.push(path);
            }
        }
    }
    Ok(removed)
}

/// Mirror rsync --delete: remove destination paths that no longer exist in
/// the source, leaving excluded paths alone.
fn delete_extraneous(source: &Path, dest: &Path, excludes: &[String]) -> Result<()> {
    let mut stack = vec![PathBuf::new()];

    while let Some(rel_dir) = stack.pop() {
        let dest_dir = dest.join(&rel_dir);
        let entries = match fs::read_dir(&dest_dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let rel = rel_dir.join(entry.file_name());
            if patterns_match(excludes, &rel) {
                continue;
            }
            let src_path = source.join(&rel);
            let dst_path = dest.join(&rel);
            if !src_path.exists() {
                let result = if dst_path.is_dir() {
                    fs::remove_dir_all(&dst_path)
                } else {
                    fs::remove_file(&dst_path)
                };
                if result.is_ok() {
                    debug!(path = %dst_path.display(), "Removed extraneous path");
                }
            } else if dst_path.is_dir() {
                stack.push(rel);
            }
        }
    }
    Ok(())
}
