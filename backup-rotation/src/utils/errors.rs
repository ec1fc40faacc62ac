//! Custom error types for backup rotation.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RotationError {
    /// A directory in the destination looks like a backup but its name does not decode.
    #[error("Failed to parse backup name '{name}': {reason}")]
    Parse { name: String, reason: String },

    #[error("{count} backups have been created today, the maximum daily backup count is {limit}")]
    QuotaExceeded { count: usize, limit: u32 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sync failed ({status}): {output}")]
    SyncFailure { status: String, output: String },

    #[error("Invalid configuration: {0}")]
    PolicyViolation(String),

    #[error("Backup catalog is corrupt: {0}")]
    CorruptCatalog(String),

    #[error("Destination is locked by another run: {}", .0.display())]
    Locked(PathBuf),

    #[error("Backup cancelled")]
    Cancelled,

    #[error("Hook script '{script}' failed ({status}): {output}")]
    Hook {
        script: String,
        status: String,
        output: String,
    },

    #[error("Notification command '{command}' failed ({status}): {output}")]
    Notify {
        command: String,
        status: String,
        output: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RotationError {
    pub(crate) fn parse(name: &str, reason: impl Into<String>) -> Self {
        RotationError::Parse {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Raw subprocess output attached to this error, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            RotationError::SyncFailure { output, .. }
            | RotationError::Hook { output, .. }
            | RotationError::Notify { output, .. } => Some(output),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for RotationError {
    fn from(e: config::ConfigError) -> Self {
        RotationError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for RotationError {
    fn from(e: toml::ser::Error) -> Self {
        RotationError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for RotationError {
    fn from(e: serde_json::Error) -> Self {
        RotationError::Serialization(e.to_string())
    }
}

impl From<nix::errno::Errno> for RotationError {
    fn from(e: nix::errno::Errno) -> Self {
        RotationError::Io(std::io::Error::from(e))
    }
}

pub type Result<T> = std::result::Result<T, RotationError>;
