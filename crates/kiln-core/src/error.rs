//! Error types for kiln-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] kiln_config::ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] kiln_engine::EngineError),

    #[error("Duplicate service name: {0}")]
    DuplicateServiceName(String),

    #[error("No such artifact: {0}")]
    NoSuchArtifact(String),

    #[error("Invalid phase: {0}")]
    UnknownPhase(String),

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Registry auth not specified")]
    MissingRegistryAuth,

    #[error("Aborted")]
    Aborted,

    #[error("Build timed out")]
    BuildTimeout,

    #[error("{0}")]
    Aggregate(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fold two optional errors into one, concatenating messages
pub fn merge_errors(err1: Option<CoreError>, err2: Option<CoreError>) -> Option<CoreError> {
    match (err1, err2) {
        (None, e) => e,
        (e, None) => e,
        (Some(e1), Some(e2)) => Some(CoreError::Aggregate(format!("{}\n{}", e1, e2))),
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
