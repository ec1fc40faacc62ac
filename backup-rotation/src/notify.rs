//! Run notifications.
//!
//! Subjects look like `<hostname>: '<source>' <message>`. Delivery failures
//! during a backup are logged and never fail the run.

use crate::config::NotifyConfig;
use crate::{Result, RotationError};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Delivers a subject and body somewhere a human will see it.
#[allow(async_fn_in_trait)]
pub trait Notifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<()>;
}

/// Build the subject line for a message about `source`.
pub fn subject(source: &str, message: &str) -> String {
    format!("{}: '{}' {}", host_name(), source, message)
}

fn host_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Send and log, but never propagate a failure.
pub async fn notify_best_effort<N: Notifier>(notifier: &N, subject: &str, body: &str) {
    if let Err(e) = notifier.notify(subject, body).await {
        warn!(subject, error = %e, "Failed to send notification");
    }
}

/// Mail-style command: `<command> -s <subject> <recipient>...`, body on stdin.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    command: String,
    recipients: Vec<String>,
}

impl CommandNotifier {
    pub fn new(command: impl Into<String>, recipients: Vec<String>) -> Self {
        Self {
            command: command.into(),
            recipients,
        }
    }
}

impl Notifier for CommandNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<()> {
        debug!(command = %self.command, recipients = ?self.recipients, subject, "Sending notification");

        let mut child = Command::new(&self.command)
            .arg("-s")
            .arg(subject)
            .args(&self.recipients)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(body.as_bytes()).await {
                Ok(()) => {}
                // The command may exit without reading; its status says more.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e.into()),
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(RotationError::Notify {
                command: self.command.clone(),
                status: output.status.to_string(),
                output: text,
            });
        }
        Ok(())
    }
}

/// Writes notifications to the log only.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<()> {
        info!(subject, "{}", body);
        Ok(())
    }
}

/// Notifier selected by the `[notify]` config section.
#[derive(Debug, Clone)]
pub enum ConfiguredNotifier {
    Command(CommandNotifier),
    Log(LogNotifier),
}

impl ConfiguredNotifier {
    pub fn from_config(config: &NotifyConfig) -> Self {
        match &config.command {
            Some(command) if !config.recipients.is_empty() => {
                Self::Command(CommandNotifier::new(command.clone(), config.recipients.clone()))
            }
            _ => Self::Log(LogNotifier),
        }
    }
}

impl Notifier for ConfiguredNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<()> {
        match self {
            Self::Command(n) => n.notify(subject, body).await,
            Self::Log(n) => n.notify(subject, body).await,
        }
    }
}
