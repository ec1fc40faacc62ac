//! Pre and post backup scripts, run through `sh -c`.

use crate::{Result, RotationError};
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

/// Run a hook script and return its combined output.
pub async fn run_hook(script: &str) -> Result<String> {
    info!(script, "Running hook script");

    let output = Command::new("sh")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        return Err(RotationError::Hook {
            script: script.to_string(),
            status: output.status.to_string(),
            output: text,
        });
    }
    Ok(text)
}
