//! Append-only status log kept next to the backups.

use crate::fs::{DiskUsage, Footprint};
use crate::Result;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const BACKUP_LOG_FILE: &str = "backup.log";

/// Written by older releases; superseded by [`BACKUP_LOG_FILE`].
pub const LEGACY_SIZE_LOG_FILE: &str = "backup_size.log";

/// What a finished (or failed) run looked like.
#[derive(Debug, Clone)]
pub struct StatusRecord<'a> {
    pub name: &'a str,
    pub disk: DiskUsage,
    /// Free space consumed by the run, GB
    pub consumed_gb: f64,
    pub elapsed: Duration,
    pub footprint: Footprint,
}

impl StatusRecord<'_> {
    pub fn line(&self) -> String {
        format!(
            "{}: Disk: Free {:.1} GB, Used {:.1} GB, Backup Size {:.1} GB, Took {}, Files {}, New {:.1} GB",
            self.name,
            self.disk.free_gb(),
            self.disk.used_gb(),
            self.consumed_gb,
            format_elapsed(self.elapsed),
            self.footprint.files,
            self.footprint.unique_gb(),
        )
    }
}

/// `HH:MM:SS`; hours keep growing past 24.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[derive(Debug, Clone)]
pub struct StatusLog {
    path: PathBuf,
}

impl StatusLog {
    pub fn new(dest: &Path) -> Self {
        Self {
            path: dest.join(BACKUP_LOG_FILE),
        }
    }

    pub fn append(&self, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        debug!(path = %self.path.display(), "Appended status line");
        Ok(())
    }

    /// Whole log, or an empty string if nothing was written yet.
    pub fn contents(&self) -> Result<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Remove the old size log if an earlier release left one behind.
pub fn remove_legacy_log(dest: &Path) -> Result<bool> {
    let legacy = dest.join(LEGACY_SIZE_LOG_FILE);
    match std::fs::remove_file(&legacy) {
        Ok(()) => {
            info!(path = %legacy.display(), "Removed legacy size log");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
