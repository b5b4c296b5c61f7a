//! Tree synchronization by shelling out to rsync.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{SyncOutcome, SyncRequest, TreeSynchronizer};
use crate::logging::LogThrottle;

pub struct RsyncSynchronizer;

impl RsyncSynchronizer {
    fn build_args(req: &SyncRequest) -> Vec<String> {
        let mut args = vec![
            "-a".to_string(),
            "--info=progress2".to_string(),
            "--itemize-changes".to_string(),
            "--no-inc-recursive".to_string(),
        ];
        if req.dry_run {
            args.push("--dry-run".to_string());
        }
        if req.delete_extraneous {
            args.push("--delete".to_string());
        }
        // Excludes first: rsync filters are first-match-wins, so they must
        // precede the catch-all exclude of include-only mode.
        for pattern in &req.excludes {
            args.push(format!("--exclude={pattern}"));
        }
        if let Some(includes) = &req.includes {
            // Include-only mode: list wanted paths, then drop everything else.
            for pattern in includes {
                args.push(format!("--include={pattern}"));
            }
            args.push("--include=*/".to_string());
            args.push("--exclude=*".to_string());
        }
        args.extend(req.extra_options.iter().cloned());
        // Trailing slash so rsync copies the directory contents.
        args.push(format!("{}/", req.source.display()));
        args.push(req.destination.display().to_string());
        args
    }
}

/// One parsed line of rsync output.
#[derive(Debug, PartialEq)]
enum OutputLine<'a> {
    Progress { bytes: u64, percentage: u8 },
    /// An itemized change; `is_file` distinguishes file transfers from
    /// directory and metadata-only entries.
    Change { flags: &'a str, path: &'a str, is_file: bool },
    Other,
}

fn classify_line<'a>(progress_re: &Regex, itemize_re: &Regex, line: &'a str) -> OutputLine<'a> {
    if let Some(capts) = progress_re.captures(line) {
        let bytes = capts[1].replace(',', "").parse().unwrap_or(0);
        let percentage = capts[2].parse().unwrap_or(0);
        return OutputLine::Progress { bytes, percentage };
    }
    if let Some(capts) = itemize_re.captures(line) {
        let flags = capts.get(1).map_or("", |m| m.as_str());
        let path = capts.get(2).map_or("", |m| m.as_str());
        let is_file = flags.as_bytes().get(1) == Some(&b'f') && !flags.starts_with('*');
        return OutputLine::Change { flags, path, is_file };
    }
    OutputLine::Other
}

#[async_trait]
impl TreeSynchronizer for RsyncSynchronizer {
    fn name(&self) -> &'static str {
        "rsync"
    }

    async fn sync(&self, req: &SyncRequest, cancel: &CancellationToken) -> Result<SyncOutcome> {
        if !req.dry_run {
            std::fs::create_dir_all(&req.destination).map_err(|e| {
                anyhow!(
                    "failed to create destination directory {}: {e}",
                    req.destination.display()
                )
            })?;
        }

        let args = Self::build_args(req);
        debug!(args = ?args, "Spawning rsync");

        let mut child = Command::new("rsync")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow!("failed to spawn rsync: {e}"))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture rsync stdout"))?;
        let mut reader = BufReader::new(stdout);

        // Progress lines look like "  12,345,678   45%  10.2MB/s ...";
        // itemized changes like ">f+++++++++ path" or "*deleting   path".
        let progress_re = Regex::new(r"^\s*([\d,]+)\s+(\d+)%")?;
        let itemize_re = Regex::new(r"^([<>ch*.][fdLDS]\S+)\s+(.+)$")?;
        let throttle = LogThrottle::new(Duration::from_millis(500));

        let mut outcome = SyncOutcome::default();
        let mut line_buffer: Vec<u8> = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    bail!("sync cancelled by operator");
                }
                read = reader.read(&mut byte) => {
                    let n = read.map_err(|e| anyhow!("failed to read rsync output: {e}"))?;
                    if n == 0 {
                        break;
                    }
                    let b = byte[0];
                    // rsync rewrites progress lines with \r
                    if b == b'\r' || b == b'\n' {
                        if line_buffer.is_empty() {
                            continue;
                        }
                        let line = String::from_utf8_lossy(&line_buffer);
                        match classify_line(&progress_re, &itemize_re, &line) {
                            OutputLine::Progress { bytes, percentage } => {
                                outcome.bytes_transferred = bytes;
                                if throttle.should_log() {
                                    info!(bytes = bytes, percentage = percentage, "Sync progress");
                                }
                            }
                            OutputLine::Change { flags, path, is_file } => {
                                if is_file {
                                    outcome.files_transferred += 1;
                                }
                                if req.dry_run {
                                    info!(change = %flags, path = %path, "Would sync");
                                } else {
                                    debug!(change = %flags, path = %path, "Synced");
                                }
                            }
                            OutputLine::Other => debug!(line = %line, "rsync output"),
                        }
                        line_buffer.clear();
                    } else {
                        line_buffer.push(b);
                    }
                }
            }
        }

        let mut stderr_text = String::new();
        if let Some(mut stderr) = child.stderr.take() {
            let _ = stderr.read_to_string(&mut stderr_text).await;
        }

        let status = child
            .wait()
            .await
            .map_err(|e| anyhow!("failed to wait for rsync: {e}"))?;

        if !status.success() {
            bail!(
                "rsync failed with status {}: {}",
                status,
                stderr_text.trim()
            );
        }

        Ok(outcome)
    }
}
