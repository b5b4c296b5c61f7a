//! Core data model: deployment runs, backups, and stage reports.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Timestamp format used in backup and run identifiers.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

/// Metadata sidecar file name, co-located with every backup payload.
pub const METADATA_FILE: &str = "backup-metadata.json";

/// Optional sidecar holding user-assigned backup tags.
pub const TAGS_FILE: &str = "tags.json";

/// Human-readable restore instructions written into every backup.
pub const RESTORE_NOTES_FILE: &str = "RESTORE.md";

/// Blake3 checksum manifest for file backup payloads.
pub const CHECKSUMS_FILE: &str = "checksums.json";

/// Subdirectory holding the file-tree payload of a backup.
pub const FILES_SUBDIR: &str = "files";

/// File name of the database dump inside a backup.
pub const DUMP_FILE: &str = "database.sql";

pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Database,
    Files,
    Full,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupType::Database => write!(f, "database"),
            BackupType::Files => write!(f, "files"),
            BackupType::Full => write!(f, "full"),
        }
    }
}

/// Machine-readable record describing a backup, used for verification and
/// listing. The `timestamp` must match the backup directory name; a
/// mismatch is treated as corruption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub backup_type: BackupType,
    /// `YYYY-MM-DDTHH-MM-SS`, matching the directory naming convention.
    pub timestamp: String,
    pub created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_revision: Option<String>,
}

impl BackupMetadata {
    pub fn load(backup_dir: &Path) -> Result<Self> {
        let path = backup_dir.join(METADATA_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("invalid backup metadata in {}", path.display()))
    }

    pub fn write(&self, backup_dir: &Path) -> Result<()> {
        let path = backup_dir.join(METADATA_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.timestamp, TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }
}

/// A backup directory on disk, discovered by listing the backup root.
#[derive(Debug, Clone)]
pub struct Backup {
    pub path: PathBuf,
    pub metadata: BackupMetadata,
    pub tags: Vec<String>,
}

impl Backup {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_dir() {
            bail!("backup directory not found: {}", path.display());
        }
        let metadata = BackupMetadata::load(path)?;
        let tags = load_tags(path);
        Ok(Self {
            path: path.to_path_buf(),
            metadata,
            tags,
        })
    }

    pub fn id(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub fn load_tags(backup_dir: &Path) -> Vec<String> {
    let path = backup_dir.join(TAGS_FILE);
    std::fs::read_to_string(&path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

pub fn save_tags(backup_dir: &Path, tags: &[String]) -> Result<()> {
    let path = backup_dir.join(TAGS_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(tags)?)
        .with_context(|| format!("failed to write {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    DryRun,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

/// One execution of the orchestrator.
#[derive(Debug, Clone)]
pub struct DeploymentRun {
    /// Unique per run: timestamp + process id.
    pub id: String,
    pub source: PathBuf,
    pub target: PathBuf,
    pub started_at: DateTime<Utc>,
    pub mode: RunMode,
    /// Set lazily once the backup stage has produced a snapshot.
    pub backup: Option<PathBuf>,
    pub status: RunStatus,
}

impl DeploymentRun {
    pub fn new(source: PathBuf, target: PathBuf, mode: RunMode) -> Self {
        let started_at = Utc::now();
        let id = format!(
            "deploy-{}-{}",
            format_timestamp(started_at),
            std::process::id()
        );
        Self {
            id,
            source,
            target,
            started_at,
            mode,
            backup: None,
            status: RunStatus::Running,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// A single finding from a check or validation.
#[derive(Debug, Clone)]
pub struct Issue {
    pub severity: Severity,
    pub message: String,
}

impl Issue {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }
}

/// Structured result of a stage. Stages accumulate issues instead of
/// aborting on the first finding; only the orchestrator decides whether a
/// report escalates to rollback.
#[derive(Debug, Default)]
pub struct StageReport {
    pub issues: Vec<Issue>,
}

impl StageReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_error(&mut self, message: impl Into<String>) {
        self.issues.push(Issue::error(message));
    }

    pub fn push_warning(&mut self, message: impl Into<String>) {
        self.issues.push(Issue::warning(message));
    }

    pub fn merge(&mut self, other: StageReport) {
        self.issues.extend(other.issues);
    }

    pub fn error_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
            .count()
    }

    pub fn passed(&self) -> bool {
        self.error_count() == 0
    }

    /// Emit every finding at its level, so a failed run is diagnosable from
    /// the log alone.
    pub fn log(&self, stage: &str) {
        for issue in &self.issues {
            match issue.severity {
                Severity::Error => error!(stage = stage, "{}", issue.message),
                Severity::Warning => warn!(stage = stage, "{}", issue.message),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn run_id_embeds_timestamp_and_pid() {
        let run = DeploymentRun::new("/src".into(), "/dst".into(), RunMode::Live);
        assert!(run.id.starts_with("deploy-"));
        assert!(run.id.ends_with(&std::process::id().to_string()));
    }

    #[test]
    fn metadata_round_trip() {
        let temp = tempdir().unwrap();
        let meta = BackupMetadata {
            backup_type: BackupType::Files,
            timestamp: "2026-01-05T12-30-00".into(),
            created_by: "stagehand".into(),
            source_path: Some("/srv/app".into()),
            file_count: Some(42),
            source_size: Some(1000),
            database_host: None,
            database_name: None,
            backup_size_bytes: None,
            git_revision: None,
        };
        meta.write(temp.path()).unwrap();

        let loaded = BackupMetadata::load(temp.path()).unwrap();
        assert_eq!(loaded.timestamp, meta.timestamp);
        assert_eq!(loaded.file_count, Some(42));
        assert!(loaded.created_at().is_some());
    }

    #[test]
    fn missing_metadata_is_an_error() {
        let temp = tempdir().unwrap();
        assert!(BackupMetadata::load(temp.path()).is_err());
    }

    #[test]
    fn tags_round_trip() {
        let temp = tempdir().unwrap();
        save_tags(temp.path(), &["stable".into()]).unwrap();
        assert_eq!(load_tags(temp.path()), vec!["stable".to_string()]);
    }

    #[test]
    fn report_counts_by_severity() {
        let mut report = StageReport::new();
        report.push_error("bad");
        report.push_warning("meh");
        report.push_error("worse");
        assert_eq!(report.error_count(), 2);
        assert_eq!(report.warning_count(), 1);
        assert!(!report.passed());
    }
}
