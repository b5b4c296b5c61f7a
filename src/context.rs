use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{DeployConfig, RuntimeEnv};
use crate::core::models::RunMode;

/// Everything a stage needs, assembled once in main and passed explicitly.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DeployConfig>,
    pub env: Arc<RuntimeEnv>,
    /// Cancelled by the orchestrator's interrupt handler; every external
    /// tool invocation honors it.
    pub cancel: CancellationToken,
    pub mode: RunMode,
    pub force: bool,
}

impl AppContext {
    pub fn new(config: DeployConfig, env: RuntimeEnv, mode: RunMode, force: bool) -> Self {
        Self {
            config: Arc::new(config),
            env: Arc::new(env),
            cancel: CancellationToken::new(),
            mode,
            force,
        }
    }

    pub fn dry_run(&self) -> bool {
        self.mode == RunMode::DryRun
    }
}
