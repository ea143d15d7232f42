//! Error types for build file parsing

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read build file at {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse YAML build file at {path}: {source}")]
    YamlParseError {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Build file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid build file: {0}")]
    Invalid(String),

    #[error("Failed to read env file {path}: {source}")]
    EnvFileError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Environment variable {0} referenced but not set")]
    MissingEnvVar(String),

    #[error("Invalid UTF-8 in env entry: {0}")]
    InvalidEnvVar(String),

    #[error("Variable not specified: {0}")]
    NoSuchVariable(String),

    #[error("Failed to write build file at {path}: {source}")]
    WriteError {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
