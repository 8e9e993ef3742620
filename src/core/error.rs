use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LanegateError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config parse error: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Manifest error in {path}: {message}")]
    ManifestError { path: PathBuf, message: String },
    #[error("Module not found: {0}")]
    ModuleNotFound(String),
    #[error("Timed out after {waited_ms}ms waiting for lock {path}")]
    LockTimeout { path: PathBuf, waited_ms: u128 },
    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl LanegateError {
    pub fn manifest(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ManifestError {
            path: path.into(),
            message: message.into(),
        }
    }
}
