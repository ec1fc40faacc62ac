//! Resolution of the backup source into the form rsync expects.

use crate::{Result, RotationError};
use nix::unistd::{getuid, User};
use std::path::Path;

/// Remote host the source lives on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SshTarget {
    /// Parse `host`, `user@host`, `host:port` or `user@host:port`.
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = || {
            RotationError::PolicyViolation(format!(
                "{} is an invalid ssh server (e.g. server, username@server or username@server:22)",
                text
            ))
        };

        let (user, rest) = match text.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => return Err(invalid()),
            None => (None, text),
        };

        let (host, port) = match rest.split(':').collect::<Vec<_>>().as_slice() {
            [host] => (*host, None),
            [host, port] => (*host, Some(port.parse::<u16>().map_err(|_| invalid())?)),
            _ => return Err(invalid()),
        };
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }

    /// Login name, defaulting to the user running the backup.
    pub fn user(&self) -> String {
        self.user.clone().unwrap_or_else(current_user)
    }

    /// rsync remote-shell option, only needed for a non-default port.
    pub fn remote_shell(&self) -> Option<String> {
        self.port.map(|port| {
            format!(
                "ssh -p {} -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
                port
            )
        })
    }
}

/// The source as handed to the sync tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSource {
    /// Source argument for rsync (`path/` or `user@host:path`)
    pub location: String,
    pub ssh: Option<SshTarget>,
}

impl BackupSource {
    /// A local directory gets a trailing `/` so its contents, not the
    /// directory itself, are mirrored.
    pub fn resolve(source: &str, ssh: Option<&str>) -> Result<Self> {
        match ssh {
            Some(text) => {
                let target = SshTarget::parse(text)?;
                Ok(Self {
                    location: format!("{}@{}:{}", target.user(), target.host, source),
                    ssh: Some(target),
                })
            }
            None => {
                let location = if Path::new(source).is_dir() && !source.ends_with('/') {
                    format!("{}/", source)
                } else {
                    source.to_string()
                };
                Ok(Self {
                    location,
                    ssh: None,
                })
            }
        }
    }

    pub fn remote_shell(&self) -> Option<String> {
        self.ssh.as_ref().and_then(SshTarget::remote_shell)
    }
}

fn current_user() -> String {
    User::from_uid(getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "root".to_string())
}
