//! Database dumping and reachability via the Postgres client tools.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{DatabaseDumper, DumpOutcome};
use crate::config::DatabaseEnv;

pub struct PgDumpDumper;

fn connection_args(db: &DatabaseEnv) -> Result<Vec<String>> {
    let host = db
        .host
        .as_deref()
        .ok_or_else(|| anyhow!("DB_HOST not set"))?;
    let database = db
        .database
        .as_deref()
        .ok_or_else(|| anyhow!("DB_DATABASE not set"))?;
    let user = db
        .user
        .as_deref()
        .ok_or_else(|| anyhow!("DB_USER not set"))?;
    Ok(vec![
        "-h".into(),
        host.into(),
        "-p".into(),
        db.port.to_string(),
        "-U".into(),
        user.into(),
        "-d".into(),
        database.into(),
    ])
}

#[async_trait]
impl DatabaseDumper for PgDumpDumper {
    async fn dump(
        &self,
        db: &DatabaseEnv,
        output: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Result<DumpOutcome> {
        let mut args = connection_args(db)?;
        // Drop-and-recreate semantics baked into the dump so a restore is
        // idempotent against a pre-existing, differently-shaped schema.
        args.extend(
            ["--clean", "--if-exists", "--no-owner", "--no-privileges"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push("-f".into());
        args.push(output.display().to_string());

        debug!(output = %output.display(), "Spawning pg_dump");

        let mut command = Command::new("pg_dump");
        command.args(&args).stdout(Stdio::null()).stderr(Stdio::piped());
        if let Some(password) = &db.password {
            command.env("PGPASSWORD", password);
        }

        let mut child = command
            .spawn()
            .map_err(|e| anyhow!("failed to spawn pg_dump: {e}"))?;

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                bail!("database dump cancelled by operator");
            }
            status = child.wait() => status.map_err(|e| anyhow!("failed to wait for pg_dump: {e}"))?,
        };

        if !status.success() {
            bail!("pg_dump exited with status {status}");
        }

        let bytes = std::fs::metadata(output).map(|m| m.len()).unwrap_or(0);
        if bytes == 0 {
            // An empty dump must never be reported as a successful backup.
            bail!("pg_dump produced an empty dump file");
        }

        info!(bytes = bytes, output = %output.display(), "Database dump complete");
        Ok(DumpOutcome { bytes })
    }

    async fn check_reachable(&self, db: &DatabaseEnv, timeout: Duration) -> Result<()> {
        let mut args = connection_args(db)?;
        args.extend(["-tAc".to_string(), "SELECT 1".to_string()]);

        let mut command = Command::new("psql");
        command.args(&args).stdout(Stdio::null()).stderr(Stdio::null());
        if let Some(password) = &db.password {
            command.env("PGPASSWORD", password);
        }

        let status = tokio::time::timeout(timeout, async {
            command
                .status()
                .await
                .map_err(|e| anyhow!("failed to run psql: {e}"))
        })
        .await
        .map_err(|_| anyhow!("database probe timed out after {timeout:?}"))??;

        if !status.success() {
            bail!("database unreachable (psql exited with {status})");
        }
        Ok(())
    }
}
