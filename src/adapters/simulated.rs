//! Simulated adapters so stage logic is testable without rsync, Postgres,
//! or network access.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
    DatabaseDumper, DumpOutcome, HealthProbe, SyncOutcome, SyncRequest, TreeSynchronizer,
    native_copy::NativeCopySynchronizer,
};
use crate::config::DatabaseEnv;

/// Records every sync request and optionally fails; delegates real copying
/// to the native engine so stage tests see actual filesystem effects.
pub struct SimulatedSynchronizer {
    pub fail_with: Option<String>,
    /// Number of initial requests that succeed before failures start.
    pub fail_after: usize,
    pub requests: Mutex<Vec<SyncRequest>>,
    inner: NativeCopySynchronizer,
}

impl SimulatedSynchronizer {
    pub fn new() -> Self {
        Self {
            fail_with: None,
            fail_after: 0,
            requests: Mutex::new(Vec::new()),
            inner: NativeCopySynchronizer,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            fail_after: 0,
            requests: Mutex::new(Vec::new()),
            inner: NativeCopySynchronizer,
        }
    }

    /// Succeed for the first `successes` requests, fail afterwards.
    pub fn failing_after(successes: usize, message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            fail_after: successes,
            requests: Mutex::new(Vec::new()),
            inner: NativeCopySynchronizer,
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl Default for SimulatedSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TreeSynchronizer for SimulatedSynchronizer {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn sync(&self, req: &SyncRequest, cancel: &CancellationToken) -> Result<SyncOutcome> {
        let seen = {
            let mut requests = match self.requests.lock() {
                Ok(r) => r,
                Err(poisoned) => poisoned.into_inner(),
            };
            requests.push(req.clone());
            requests.len()
        };
        if let Some(message) = &self.fail_with
            && seen > self.fail_after
        {
            bail!("{message}");
        }
        self.inner.sync(req, cancel).await
    }
}

/// Writes a plausible dump file without touching a real database.
pub struct SimulatedDumper {
    pub fail: bool,
    /// Write a zero-byte dump to exercise the empty-dump check.
    pub empty: bool,
}

impl SimulatedDumper {
    pub fn ok() -> Self {
        Self {
            fail: false,
            empty: false,
        }
    }
}

#[async_trait]
impl DatabaseDumper for SimulatedDumper {
    async fn dump(
        &self,
        db: &DatabaseEnv,
        output: &Path,
        _cancel: &CancellationToken,
    ) -> Result<DumpOutcome> {
        if self.fail {
            bail!("simulated dump failure");
        }
        if self.empty {
            std::fs::write(output, b"")?;
            bail!("pg_dump produced an empty dump file");
        }
        let database = db.database.as_deref().unwrap_or("app");
        let dump = format!(
            "--\n-- PostgreSQL database dump\n--\n\nDROP TABLE IF EXISTS example;\n-- dump of {database}\n"
        );
        std::fs::write(output, &dump)?;
        Ok(DumpOutcome {
            bytes: dump.len() as u64,
        })
    }

    async fn check_reachable(&self, _db: &DatabaseEnv, _timeout: Duration) -> Result<()> {
        if self.fail {
            bail!("simulated database unreachable");
        }
        Ok(())
    }
}

/// Returns a fixed status code per URL suffix, or an error.
pub struct SimulatedProbe {
    pub status: u16,
    pub unreachable: bool,
}

impl SimulatedProbe {
    pub fn healthy() -> Self {
        Self {
            status: 200,
            unreachable: false,
        }
    }

    pub fn down() -> Self {
        Self {
            status: 0,
            unreachable: true,
        }
    }
}

#[async_trait]
impl HealthProbe for SimulatedProbe {
    async fn get_status(&self, url: &str, _timeout: Duration) -> Result<u16> {
        if self.unreachable {
            bail!("probe of {url} failed: connection refused");
        }
        Ok(self.status)
    }
}
