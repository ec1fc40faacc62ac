//! Configuration management for backup rotation.
//!
//! Built-in defaults, then an optional TOML file, then environment variable
//! overrides (`BACKUP_ROTATION__<SECTION>__<KEY>`). Command-line flags are
//! applied on top by the binary.

use crate::executor::source::SshTarget;
use crate::rotation::RetentionPolicy;
use crate::{Result, RotationError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable prefix; sections and keys are separated by `__`.
pub const ENV_PREFIX: &str = "BACKUP_ROTATION";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub disk: DiskConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Path to back up. Passed to rsync as is, so rsync patterns work.
    pub source: Option<String>,

    /// Directory holding the backup generations
    pub dest: Option<PathBuf>,

    /// rsync exclude patterns
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Remote source host: `host`, `user@host` or `user@host:port`
    pub ssh: Option<String>,

    /// Create the destination if it does not exist
    #[serde(default = "default_create_dest")]
    pub create_dest: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// rsync binary
    #[serde(default = "default_rsync_path")]
    pub rsync_path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Shell command run before the sync (e.g. create an LVM snapshot)
    pub pre_script: Option<String>,

    /// Shell command run after the sync, whether it succeeded or not
    pub post_script: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Mail-style command, invoked as `<command> -s <subject> <recipient>...`
    pub command: Option<String>,

    #[serde(default)]
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Warn when free space on the destination drops below this (MB)
    #[serde(default = "default_low_space_mb")]
    pub low_space_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Append log output to this file as well as stdout
    pub file: Option<PathBuf>,
}

// Default values
fn default_create_dest() -> bool {
    true
}

fn default_rsync_path() -> PathBuf {
    PathBuf::from("/usr/bin/rsync")
}

fn default_low_space_mb() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            source: None,
            dest: None,
            exclude: Vec::new(),
            ssh: None,
            create_dest: default_create_dest(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rsync_path: default_rsync_path(),
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            low_space_mb: default_low_space_mb(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional TOML file and the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from(path, None)
    }

    /// `env` replaces the process environment when given.
    fn load_from(path: Option<&Path>, env: Option<::config::Map<String, String>>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Toml),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("backup.exclude")
                .with_list_parse_key("notify.recipients")
                .source(env),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Render as TOML, the same format [`Config::load`] reads.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save the effective configuration so later runs can load it with
    /// `--config`.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_toml()?)?;
        info!(path = %path.display(), "Saved configuration");
        Ok(())
    }

    pub fn source(&self) -> Result<&str> {
        self.backup.source.as_deref().ok_or_else(|| {
            RotationError::PolicyViolation("Please define the source path".into())
        })
    }

    pub fn dest(&self) -> Result<&Path> {
        self.backup.dest.as_deref().ok_or_else(|| {
            RotationError::PolicyViolation("Please define the destination path".into())
        })
    }

    /// Reject unusable settings before anything touches the destination.
    pub fn validate(&self) -> Result<()> {
        self.source()?;
        self.dest()?;
        self.validate_policy()
    }

    /// Checks shared by every command, including ones that need no source.
    pub fn validate_policy(&self) -> Result<()> {
        self.retention.validate()?;

        if let Some(ssh) = &self.backup.ssh {
            SshTarget::parse(ssh)?;
        }

        match (&self.notify.command, self.notify.recipients.is_empty()) {
            (Some(_), true) => Err(RotationError::PolicyViolation(
                "A notify command needs at least one recipient".into(),
            )),
            (None, false) => Err(RotationError::PolicyViolation(
                "Notify recipients are set but no notify command is defined".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Make sure the destination directory exists, creating it if allowed.
    pub fn ensure_dest(&self) -> Result<&Path> {
        let dest = self.dest()?;
        if !dest.is_dir() {
            if !self.backup.create_dest {
                return Err(RotationError::PolicyViolation(format!(
                    "{} path does not exist",
                    dest.display()
                )));
            }
            std::fs::create_dir_all(dest)?;
            info!(dest = %dest.display(), "Created backup destination");
        }
        Ok(dest)
    }
}
