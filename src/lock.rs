//! Exclusive deploy lock, one per target tree.
//!
//! Two orchestrator runs interleaving their rename-swaps against the same
//! target would corrupt it; an atomic create-new lock file in the target's
//! parent directory prevents that. The lock lives next to the target, not
//! inside it, so the rename-swap of the target itself never moves it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Locks idle longer than this are assumed abandoned and broken.
const STALE_AFTER_HOURS: i64 = 1;

/// Information about who holds a deploy lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Hostname of the machine that holds the lock.
    pub holder: String,
    /// Process ID of the lock holder.
    pub pid: u32,
    /// When the lock was acquired.
    pub started_at: DateTime<Utc>,
}

impl LockInfo {
    fn new() -> Self {
        let holder = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            holder,
            pid: std::process::id(),
            started_at: Utc::now(),
        }
    }

    pub fn is_stale(&self) -> bool {
        (Utc::now() - self.started_at).num_hours() >= STALE_AFTER_HOURS
    }
}

/// Path of the lock file guarding `target`.
pub fn lock_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "target".to_string());
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".stagehand-{name}.lock"))
}

/// A held deploy lock. Released explicitly or on drop.
#[derive(Debug)]
pub struct DeployLock {
    path: PathBuf,
    released: bool,
}

impl DeployLock {
    /// Acquire the lock for a target.
    ///
    /// Uses `O_CREAT|O_EXCL` for atomic acquisition (no TOCTOU race).
    /// Stale (>1h) or corrupted locks are broken with a warning; `force`
    /// breaks a live lock.
    pub fn acquire(target: &Path, force: bool) -> Result<Self> {
        let path = lock_path(target);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        match Self::try_create(&path) {
            Ok(lock) => return Ok(lock),
            Err(e) if !path.exists() => return Err(e),
            Err(_) => {}
        }

        // Lock file exists. Decide whether to break it.
        let existing: Option<LockInfo> = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok());

        match existing {
            Some(info) if !force && !info.is_stale() => {
                bail!(
                    "deploy lock held by {} (pid {}) since {}; use --force to break it",
                    info.holder,
                    info.pid,
                    info.started_at
                );
            }
            Some(info) => {
                warn!(
                    holder = %info.holder,
                    pid = info.pid,
                    since = %info.started_at,
                    forced = force,
                    "Breaking existing deploy lock"
                );
            }
            None => {
                warn!(path = %path.display(), "Lock file unreadable, breaking it");
            }
        }

        std::fs::remove_file(&path)
            .with_context(|| format!("failed to remove stale lock {}", path.display()))?;
        Self::try_create(&path)
    }

    fn try_create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("failed to acquire deploy lock {}", path.display()))?;

        let info = LockInfo::new();
        let json = serde_json::to_string_pretty(&info)?;
        file.write_all(json.as_bytes())?;

        debug!(path = %path.display(), pid = info.pid, "Deploy lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            released: false,
        })
    }

    /// Release the lock.
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if !self.released {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to remove deploy lock");
            }
            self.released = true;
        }
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_and_release() {
        let temp = tempdir().unwrap();
        let target = temp.path().join("site");

        let lock = DeployLock::acquire(&target, false).unwrap();
        assert!(lock_path(&target).exists());
        lock.release();
        assert!(!lock_path(&target).exists());
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let temp = tempdir().unwrap();
        let target = temp.path().join("site");

        let _lock = DeployLock::acquire(&target, false).unwrap();
        let err = DeployLock::acquire(&target, false);
        assert!(err.is_err());
        assert!(err.unwrap_err().to_string().contains("deploy lock held"));
    }

    #[test]
    fn force_breaks_live_lock() {
        let temp = tempdir().unwrap();
        let target = temp.path().join("site");

        let _lock = DeployLock::acquire(&target, false).unwrap();
        let second = DeployLock::acquire(&target, true);
        assert!(second.is_ok());
    }

    #[test]
    fn stale_lock_is_broken() {
        let temp = tempdir().unwrap();
        let target = temp.path().join("site");
        let path = lock_path(&target);

        let info = LockInfo {
            holder: "otherhost".into(),
            pid: 1234,
            started_at: Utc::now() - chrono::Duration::hours(2),
        };
        std::fs::write(&path, serde_json::to_string(&info).unwrap()).unwrap();

        let lock = DeployLock::acquire(&target, false);
        assert!(lock.is_ok());
    }

    #[test]
    fn corrupted_lock_is_broken() {
        let temp = tempdir().unwrap();
        let target = temp.path().join("site");
        std::fs::write(lock_path(&target), "not json").unwrap();

        assert!(DeployLock::acquire(&target, false).is_ok());
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        let target = temp.path().join("site");
        {
            let _lock = DeployLock::acquire(&target, false).unwrap();
        }
        assert!(!lock_path(&target).exists());
    }
}
