//! Remote shell transport.
//!
//! The driver reaches the agent host only through a [`RemoteShell`]: run a
//! shell command, copy files to the host, copy files back. [`SshTransport`]
//! is the production implementation; tests substitute scripted fakes.

mod ssh;

pub use ssh::{SshOptions, SshTransport};

use crate::errors::{PowercycleError, RemoteCommandError, TransportError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Substrings that mark a transient transport failure worth retrying.
pub const RETRYABLE_MARKERS: [&str; 5] = [
    "Connection refused",
    "Connection timed out during banner exchange",
    "Permission denied",
    "System is booting up",
    "Connection reset by peer",
];

/// Prefix the ssh client puts on its own diagnostics.
pub const CLIENT_DIAGNOSTIC_PREFIX: &str = "ssh:";

/// Exit status the ssh client uses for its own failures.
const SSH_CLIENT_EXIT_CODE: i32 = 255;

pub fn is_retryable(output: &str) -> bool {
    RETRYABLE_MARKERS.iter().any(|marker| output.contains(marker))
}

/// Whether a failed invocation broke in the channel rather than in the
/// remote command.
pub fn is_transport_failure(exit_code: i32, stderr: &str) -> bool {
    stderr.trim_start().starts_with(CLIENT_DIAGNOSTIC_PREFIX)
        || (exit_code == SSH_CLIENT_EXIT_CODE && is_retryable(stderr))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub const NONE: RetryPolicy = RetryPolicy {
        retries: 0,
        backoff: Duration::ZERO,
    };
}

/// Result of a remote invocation whose channel worked.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// stdout followed by stderr.
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    fn user_host(&self) -> &str;

    /// Check the host is reachable, retrying transient failures. Used at
    /// startup and again after every crash.
    async fn probe(&self) -> Result<CommandOutput, TransportError>;

    /// Run `command` through the remote shell, optionally from
    /// `working_dir`. A non-zero exit of the command itself is returned in
    /// the output, not as an error.
    async fn shell(
        &self,
        command: &str,
        working_dir: Option<&str>,
    ) -> Result<CommandOutput, TransportError>;

    /// Like [`shell`](Self::shell) but never retried. Used for commands
    /// that must not run twice, such as the crash itself.
    async fn shell_once(
        &self,
        command: &str,
        working_dir: Option<&str>,
    ) -> Result<CommandOutput, TransportError> {
        self.shell(command, working_dir).await
    }

    /// Copy local files or directories into `remote_dir` (the login
    /// directory when `None`).
    async fn copy_to(
        &self,
        paths: &[PathBuf],
        remote_dir: Option<&str>,
    ) -> Result<CommandOutput, TransportError>;

    /// Copy remote paths (globs allowed) into an existing local directory.
    async fn copy_from(
        &self,
        paths: &[String],
        local_dir: &Path,
    ) -> Result<CommandOutput, TransportError>;
}

/// Run `command` and turn a non-zero exit into a [`RemoteCommandError`].
pub async fn shell_checked(
    shell: &dyn RemoteShell,
    command: &str,
    working_dir: Option<&str>,
) -> Result<CommandOutput, PowercycleError> {
    let result = shell.shell(command, working_dir).await?;
    if result.success() {
        Ok(result)
    } else {
        Err(RemoteCommandError {
            command: command.to_string(),
            exit_code: result.exit_code,
            output: result.output,
        }
        .into())
    }
}

/// Run `command` for its side effects only; every failure is logged and
/// swallowed.
pub async fn shell_best_effort(shell: &dyn RemoteShell, command: &str, working_dir: Option<&str>) {
    match shell.shell(command, working_dir).await {
        Ok(result) if result.success() => {}
        Ok(result) => tracing::debug!(
            command,
            exit_code = result.exit_code,
            output = %result.output.trim(),
            "Ignoring remote command failure"
        ),
        Err(err) => tracing::debug!(command, error = %err, "Ignoring transport failure"),
    }
}
