pub mod backup;
pub mod extensions;
pub mod fsops;
pub mod models;
pub mod orchestrator;
pub mod preflight;
pub mod rollback;
pub mod sync;
pub mod validate;
pub mod verifier;

pub use models::{
    Backup, BackupMetadata, BackupType, DeploymentRun, Issue, RunMode, RunStatus, Severity,
    StageReport,
};
pub use orchestrator::Orchestrator;
