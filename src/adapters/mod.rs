//! Narrow interfaces over the external tools the pipeline shells out to.
//!
//! One production implementation per capability plus a simulated one, so
//! the whole pipeline is testable without real rsync, Postgres, or network
//! access.

pub mod http_probe;
pub mod native_copy;
pub mod pg_dump;
pub mod rsync;
pub mod simulated;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::DatabaseEnv;

/// A request to replicate one directory tree into another.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// rsync-style exclude patterns.
    pub excludes: Vec<String>,
    /// When set, only matching paths are synced (include-only mode).
    pub includes: Option<Vec<String>>,
    /// Remove destination paths absent from the source.
    pub delete_extraneous: bool,
    /// Extra flag strings passed through to the tool, if it supports them.
    pub extra_options: Vec<String>,
    /// Report what would be done without writing anything.
    pub dry_run: bool,
}

impl SyncRequest {
    pub fn new(source: PathBuf, destination: PathBuf) -> Self {
        Self {
            source,
            destination,
            excludes: Vec::new(),
            includes: None,
            delete_extraneous: false,
            extra_options: Vec::new(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SyncOutcome {
    pub files_transferred: u64,
    pub bytes_transferred: u64,
}

/// Replicates directory trees. Production impls: rsync shell-out, native
/// recursive copy fallback.
#[async_trait]
pub trait TreeSynchronizer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn sync(&self, req: &SyncRequest, cancel: &CancellationToken) -> Result<SyncOutcome>;
}

#[derive(Debug)]
pub struct DumpOutcome {
    pub bytes: u64,
}

/// Produces logical database dumps and answers reachability probes.
#[async_trait]
pub trait DatabaseDumper: Send + Sync {
    /// Dump the database to `output` with drop-and-recreate semantics
    /// embedded, so a restore is idempotent against an existing schema.
    async fn dump(
        &self,
        db: &DatabaseEnv,
        output: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Result<DumpOutcome>;

    /// Lightweight connectivity check with a bounded timeout.
    async fn check_reachable(&self, db: &DatabaseEnv, timeout: Duration) -> Result<()>;
}

/// Probes an HTTP endpoint, returning the status code.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn get_status(&self, url: &str, timeout: Duration) -> Result<u16>;
}

/// Whether an executable is resolvable on PATH.
pub fn tool_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| {
        let candidate = dir.join(name);
        candidate.is_file()
    })
}

/// Pick the best available synchronizer: rsync when installed, otherwise
/// the native copy fallback.
pub fn synchronizer() -> Box<dyn TreeSynchronizer> {
    if tool_on_path("rsync") {
        Box::new(rsync::RsyncSynchronizer)
    } else {
        tracing::warn!("rsync not found on PATH, using native copy fallback");
        Box::new(native_copy::NativeCopySynchronizer)
    }
}

pub fn database_dumper() -> Box<dyn DatabaseDumper> {
    Box::new(pg_dump::PgDumpDumper)
}

pub fn health_probe() -> Box<dyn HealthProbe> {
    Box::new(http_probe::HttpProbe::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_on_path_finds_common_shell() {
        // `sh` exists on any unix CI box this runs on.
        assert!(tool_on_path("sh"));
        assert!(!tool_on_path("definitely-not-a-real-tool-xyz"));
    }
}
