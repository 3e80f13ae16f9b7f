use thiserror::Error;

use crate::cache::OrchestratorError;
use crate::config::LoadError;
use crate::runtime::RuntimeError;

/// Failures that end the binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
