//! The sync step: mirror the source into the new backup directory,
//! hard-linking unchanged files against the link base.

use crate::{Result, RotationError};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a cancelled sync gets to exit after SIGTERM before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// One sync of a source into a backup directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    /// rsync source argument (`dir/` or `user@host:dir`)
    pub source: String,
    /// The `.incomplete` directory being filled
    pub destination: PathBuf,
    /// Previous backup to hard-link unchanged files against
    pub link_base: Option<PathBuf>,
    pub excludes: Vec<String>,
    /// Remote shell command, set for ssh sources on a custom port
    pub remote_shell: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    /// Combined stdout and stderr of the sync tool
    pub output: String,
}

/// Something that can fill a backup directory from a source.
#[allow(async_fn_in_trait)]
pub trait SyncInvoker {
    /// Fail early if the sync tool is unusable.
    fn check(&self) -> Result<()> {
        Ok(())
    }

    /// Human-readable command line, used in notifications.
    fn describe(&self, request: &SyncRequest) -> String;

    /// Run the sync. Must stop and return `Cancelled` once `cancel` fires.
    async fn sync(&self, request: &SyncRequest, cancel: &CancellationToken) -> Result<SyncOutcome>;
}

/// Runs the rsync binary.
#[derive(Debug, Clone)]
pub struct RsyncInvoker {
    program: PathBuf,
    grace: Duration,
}

impl RsyncInvoker {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            grace: TERMINATE_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Arguments after the program name.
    pub fn arguments(&self, request: &SyncRequest) -> Vec<String> {
        let mut args = vec![
            "-avh".to_string(),
            "--safe-links".to_string(),
            "--delete".to_string(),
        ];
        if let Some(base) = &request.link_base {
            args.push(format!("--link-dest={}", base.display()));
        }
        for pattern in &request.excludes {
            args.push("--exclude".to_string());
            args.push(pattern.clone());
        }
        if let Some(shell) = &request.remote_shell {
            args.push("-e".to_string());
            args.push(shell.clone());
        }
        args.push(request.source.clone());
        args.push(request.destination.display().to_string());
        args
    }
}

impl SyncInvoker for RsyncInvoker {
    fn check(&self) -> Result<()> {
        if self.program.components().count() > 1 {
            if self.program.is_file() {
                return Ok(());
            }
        } else if let Some(paths) = std::env::var_os("PATH") {
            if std::env::split_paths(&paths).any(|dir| dir.join(&self.program).is_file()) {
                return Ok(());
            }
        }
        Err(RotationError::NotFound(format!(
            "rsync program {}",
            self.program.display()
        )))
    }

    fn describe(&self, request: &SyncRequest) -> String {
        let mut line = self.program.display().to_string();
        for arg in self.arguments(request) {
            line.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                line.push('"');
                line.push_str(&arg);
                line.push('"');
            } else {
                line.push_str(&arg);
            }
        }
        line
    }

    async fn sync(&self, request: &SyncRequest, cancel: &CancellationToken) -> Result<SyncOutcome> {
        info!(
            source = %request.source,
            destination = %request.destination.display(),
            link_base = ?request.link_base,
            "Starting rsync"
        );

        let child = Command::new(&self.program)
            .args(self.arguments(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();

        let output = child.wait_with_output();
        tokio::pin!(output);

        tokio::select! {
            result = &mut output => {
                let output = result?;
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));

                if !output.status.success() {
                    return Err(RotationError::SyncFailure {
                        status: output.status.to_string(),
                        output: text,
                    });
                }
                debug!(bytes = text.len(), "rsync finished");
                Ok(SyncOutcome { output: text })
            }
            _ = cancel.cancelled() => {
                warn!("Cancellation requested, terminating rsync");
                if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
                    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                        debug!(error = %e, "Failed to signal rsync");
                    }
                }
                if tokio::time::timeout(self.grace, &mut output).await.is_err() {
                    // Dropping the future drops the child, which kills it.
                    warn!(grace = ?self.grace, "rsync ignored SIGTERM, killing it");
                }
                Err(RotationError::Cancelled)
            }
        }
    }
}
