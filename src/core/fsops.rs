//! Shared filesystem helpers used by the backup, sync, and rollback stages.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

/// Buffer size for file I/O operations (128KB for throughput)
const BUFFER_SIZE: usize = 128 * 1024;

/// Aggregate numbers from a recursive tree scan.
#[derive(Debug, Default, Clone, Copy)]
pub struct TreeStats {
    pub file_count: u64,
    pub total_bytes: u64,
    pub zero_byte_files: u64,
}

/// Recursively scan a tree, counting regular files. Symlinks and special
/// files are skipped, matching what the copy routines do.
pub fn scan_tree(root: &Path) -> Result<TreeStats> {
    let mut stats = TreeStats::default();
    scan_recursive(root, &mut stats)?;
    Ok(stats)
}

fn scan_recursive(current: &Path, stats: &mut TreeStats) -> Result<()> {
    let entries = fs::read_dir(current)
        .with_context(|| format!("failed to read directory {}", current.display()))?;

    for entry in entries {
        let entry = entry.context("failed to read directory entry")?;
        let path = entry.path();

        // symlink_metadata so we never follow links out of the tree
        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if metadata.is_dir() {
            scan_recursive(&path, stats)?;
        } else if metadata.is_file() {
            stats.file_count += 1;
            stats.total_bytes += metadata.len();
            if metadata.len() == 0 {
                stats.zero_byte_files += 1;
            }
        }
    }
    Ok(())
}

/// Recursively copy `source` into `dest`, preserving permissions and
/// timestamps. `dest` is created if missing; existing files are
/// overwritten.
pub fn copy_tree(source: &Path, dest: &Path) -> Result<TreeStats> {
    fs::create_dir_all(dest)
        .with_context(|| format!("failed to create {}", dest.display()))?;

    let mut stats = TreeStats::default();
    copy_recursive(source, dest, &mut stats)?;
    Ok(stats)
}

fn copy_recursive(source: &Path, dest: &Path, stats: &mut TreeStats) -> Result<()> {
    let entries = fs::read_dir(source)
        .with_context(|| format!("failed to read directory {}", source.display()))?;

    for entry in entries {
        let entry = entry.context("failed to read directory entry")?;
        let path = entry.path();
        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        let dest_path = dest.join(entry.file_name());

        if metadata.is_dir() {
            fs::create_dir_all(&dest_path)
                .with_context(|| format!("failed to create {}", dest_path.display()))?;
            if let Err(e) = fs::set_permissions(&dest_path, metadata.permissions()) {
                debug!(path = %dest_path.display(), error = %e, "Failed to set directory permissions");
            }
            copy_recursive(&path, &dest_path, stats)?;
        } else if metadata.is_file() {
            let bytes = copy_file(&path, &dest_path)?;
            stats.file_count += 1;
            stats.total_bytes += bytes;
            if bytes == 0 {
                stats.zero_byte_files += 1;
            }
        }
        // Symlinks and special files are intentionally not copied.
    }
    Ok(())
}

/// Copy a single file with buffered I/O, preserving mode and timestamps.
pub fn copy_file(source: &Path, dest: &Path) -> Result<u64> {
    let metadata = fs::metadata(source)
        .with_context(|| format!("failed to stat {}", source.display()))?;

    let src_file =
        File::open(source).with_context(|| format!("failed to open {}", source.display()))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, src_file);

    let dst_file =
        File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dst_file);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut written: u64 = 0;
    loop {
        let n = reader
            .read(&mut buffer)
            .with_context(|| format!("failed to read {}", source.display()))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buffer[..n])
            .with_context(|| format!("failed to write {}", dest.display()))?;
        written += n as u64;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", dest.display()))?;

    if let Err(e) = fs::set_permissions(dest, metadata.permissions()) {
        debug!(dest = %dest.display(), error = %e, "Failed to set file permissions");
    }
    if let Err(e) = preserve_timestamps(source, dest) {
        debug!(dest = %dest.display(), error = %e, "Failed to preserve timestamps");
    }

    Ok(written)
}

/// Preserve access and modification timestamps from source to destination
pub fn preserve_timestamps(source: &Path, dest: &Path) -> Result<()> {
    let metadata = fs::metadata(source)?;
    let atime = filetime::FileTime::from_last_access_time(&metadata);
    let mtime = filetime::FileTime::from_last_modification_time(&metadata);
    filetime::set_file_times(dest, atime, mtime)?;
    Ok(())
}

/// Sample up to `limit` files under `root`, checking each opens readably.
/// Returns (checked, unreadable).
pub fn sample_readable(root: &Path, limit: usize) -> Result<(usize, Vec<PathBuf>)> {
    let mut checked = 0usize;
    let mut unreadable = Vec::new();
    sample_recursive(root, limit, &mut checked, &mut unreadable)?;
    Ok((checked, unreadable))
}

fn sample_recursive(
    current: &Path,
    limit: usize,
    checked: &mut usize,
    unreadable: &mut Vec<PathBuf>,
) -> Result<()> {
    if *checked >= limit {
        return Ok(());
    }
    let entries = fs::read_dir(current)
        .with_context(|| format!("failed to read directory {}", current.display()))?;

    for entry in entries {
        if *checked >= limit {
            break;
        }
        let entry = entry.context("failed to read directory entry")?;
        let path = entry.path();
        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(_) => {
                unreadable.push(path);
                continue;
            }
        };
        if metadata.is_dir() {
            sample_recursive(&path, limit, checked, unreadable)?;
        } else if metadata.is_file() {
            *checked += 1;
            let mut byte = [0u8; 1];
            match File::open(&path).and_then(|mut f| f.read(&mut byte)) {
                Ok(_) => {}
                Err(_) => unreadable.push(path),
            }
        }
    }
    Ok(())
}

/// The closest existing ancestor of a path, used for disk-space and
/// writability checks on targets that don't exist yet.
pub fn nearest_existing_ancestor(path: &Path) -> Result<PathBuf> {
    let mut current = path;
    loop {
        if current.exists() {
            return Ok(current.to_path_buf());
        }
        current = current
            .parent()
            .ok_or_else(|| anyhow!("no existing ancestor for {}", path.display()))?;
    }
}
