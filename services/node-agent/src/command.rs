//! Host command execution.
//!
//! Both host adapters drive system tools (`virsh`, `qemu-img`,
//! `cloud-localds`, `iptables`, `ip`). This wraps `tokio::process` so a
//! non-zero exit comes back as an error carrying the trimmed stderr.

use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors from running a host command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: i32,
        stderr: String,
    },
}

impl CommandError {
    /// Stderr of a failed command, empty for spawn failures.
    pub fn stderr(&self) -> &str {
        match self {
            Self::Failed { stderr, .. } => stderr,
            Self::Spawn { .. } => "",
        }
    }
}

/// Run a command and return its stdout.
pub async fn run(program: &str, args: &[&str]) -> Result<String, CommandError> {
    debug!(program, args = %args.join(" "), "Running host command");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(CommandError::Failed {
            command: format!("{} {}", program, args.join(" ")),
            status: output.status.code().unwrap_or(-1),
            stderr,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a command and report only whether it exited successfully.
///
/// Used for probes such as `iptables -C`, where a non-zero exit is an answer
/// rather than a failure.
pub async fn succeeds(program: &str, args: &[&str]) -> Result<bool, CommandError> {
    match run(program, args).await {
        Ok(_) => Ok(true),
        Err(CommandError::Failed { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}
