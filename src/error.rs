//! Stage failure taxonomy and the exit-code contract.
//!
//! Every stage reports failure through `StageError`; the orchestrator is the
//! only place that decides whether a failure escalates to rollback. Exit
//! codes are stable across all subcommands so that wrapping automation can
//! branch on them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    /// Bad flags, missing directories, unparseable config. No side effects
    /// have occurred when this is returned.
    #[error("invalid usage: {0}")]
    Usage(String),

    /// One or more pre-flight checks failed. All failures are reported
    /// before this is returned, not just the first.
    #[error("pre-flight failed: {failed} check(s) did not pass")]
    Preflight { failed: usize },

    /// Backup could not be taken. The target has not been mutated.
    #[error("backup failed: {0}")]
    Backup(anyhow::Error),

    /// Sync or extension deploy failed and no rollback was performed.
    #[error("deployment failed: {0}")]
    Deploy(anyhow::Error),

    /// Post-deploy validation found issues and no rollback was performed.
    #[error("post-deploy validation found {issues} issue(s)")]
    Validation { issues: usize },

    /// Operator interrupted the run, or declined a confirmation prompt.
    #[error("operation cancelled")]
    Cancelled,

    /// Deployment failed but the automatic rollback completed.
    #[error("deployment failed; target rolled back to {backup}")]
    RolledBack { backup: String },

    /// Rollback itself failed. Manual intervention is required; there is no
    /// automated recovery below this layer.
    #[error("rollback failed: {0}")]
    Rollback(anyhow::Error),
}

impl StageError {
    pub fn exit_code(&self) -> u8 {
        match self {
            StageError::Deploy(_) => 1,
            StageError::Usage(_) | StageError::Preflight { .. } | StageError::Validation { .. } => {
                2
            }
            StageError::Cancelled | StageError::Backup(_) => 3,
            StageError::RolledBack { .. } => 4,
            StageError::Rollback(_) => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_do_not_collide_within_category() {
        let usage = StageError::Usage("x".into());
        let preflight = StageError::Preflight { failed: 2 };
        let validation = StageError::Validation { issues: 1 };
        assert_eq!(usage.exit_code(), 2);
        assert_eq!(preflight.exit_code(), 2);
        assert_eq!(validation.exit_code(), 2);

        assert_eq!(StageError::Deploy(anyhow::anyhow!("x")).exit_code(), 1);
        assert_eq!(StageError::Cancelled.exit_code(), 3);
        assert_eq!(StageError::Backup(anyhow::anyhow!("x")).exit_code(), 3);
        assert_eq!(
            StageError::RolledBack {
                backup: "b".into()
            }
            .exit_code(),
            4
        );
        assert_eq!(StageError::Rollback(anyhow::anyhow!("x")).exit_code(), 5);
    }
}
