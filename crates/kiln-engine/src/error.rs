//! Error types for container engines

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to connect to container engine: {0}")]
    ConnectionError(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Build failed: {0}")]
    BuildError(String),

    #[error("Push failed: {0}")]
    PushError(String),

    #[error("Container engine error: {0}")]
    RuntimeError(String),

    #[error("Invalid container spec: {0}")]
    InvalidSpec(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<bollard::errors::Error> for EngineError {
    fn from(e: bollard::errors::Error) -> Self {
        EngineError::RuntimeError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
