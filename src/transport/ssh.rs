//! ssh/scp implementation of [`RemoteShell`].

use super::{CommandOutput, RemoteShell, RetryPolicy, is_retryable, is_transport_failure};
use crate::errors::TransportError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const DEFAULT_CONNECTION_OPTIONS: [&str; 10] = [
    "-o",
    "ServerAliveCountMax=10",
    "-o",
    "ServerAliveInterval=6",
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "ConnectTimeout=10",
    "-o",
    "ConnectionAttempts=20",
];

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub ssh_program: PathBuf,
    pub scp_program: PathBuf,
    /// Options shared by ssh and scp.
    pub connection_options: Vec<String>,
    /// Force a pseudo-tty, needed when remote commands use sudo.
    pub force_tty: bool,
    /// Shell the remote command line is handed to.
    pub shell_binary: String,
    pub access_retry_count: u32,
    pub access_retry_sleep: Duration,
    pub retry: RetryPolicy,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            scp_program: PathBuf::from("scp"),
            connection_options: DEFAULT_CONNECTION_OPTIONS
                .iter()
                .map(ToString::to_string)
                .collect(),
            force_tty: false,
            shell_binary: "/bin/bash".to_string(),
            access_retry_count: 5,
            access_retry_sleep: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl SshOptions {
    /// Append user-supplied connection options (a shell-quoted string).
    pub fn with_extra_connection_options(mut self, extra: &str) -> anyhow::Result<Self> {
        self.connection_options.extend(shell_words::split(extra)?);
        Ok(self)
    }
}

struct RawOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl RawOutput {
    fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

pub struct SshTransport {
    user_host: String,
    options: SshOptions,
}

impl SshTransport {
    pub fn new(user_host: impl Into<String>, options: SshOptions) -> Self {
        Self {
            user_host: user_host.into(),
            options,
        }
    }

    fn ssh_args(&self) -> Vec<String> {
        let mut args = self.options.connection_options.clone();
        if self.options.force_tty {
            args.push("-tt".to_string());
        }
        args.push(self.user_host.clone());
        args
    }

    fn scp_args(&self) -> Vec<String> {
        let mut args = vec!["-rp".to_string()];
        args.extend(self.options.connection_options.iter().cloned());
        args
    }

    async fn call(&self, program: &Path, args: &[String]) -> Result<RawOutput, TransportError> {
        debug!(program = %program.display(), args = ?args, "Invoking transport");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| TransportError::Spawn {
                program: program.display().to_string(),
                source,
            })?;
        Ok(RawOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run one invocation, retrying only transient transport failures.
    async fn perform(
        &self,
        program: &Path,
        args: &[String],
        retry: RetryPolicy,
    ) -> Result<CommandOutput, TransportError> {
        let mut attempt = 0;
        loop {
            let raw = self.call(program, args).await?;
            if raw.exit_code == 0 || !is_transport_failure(raw.exit_code, &raw.stderr) {
                return Ok(CommandOutput {
                    exit_code: raw.exit_code,
                    output: raw.combined(),
                });
            }
            if attempt >= retry.retries || !is_retryable(&raw.stderr) {
                return Err(TransportError::Channel {
                    user_host: self.user_host.clone(),
                    exit_code: raw.exit_code,
                    output: raw.combined(),
                });
            }
            attempt += 1;
            warn!(
                user_host = %self.user_host,
                attempt,
                stderr = %raw.stderr.trim(),
                "Transport failure, retrying in {}s",
                retry.backoff.as_secs()
            );
            tokio::time::sleep(retry.backoff).await;
        }
    }

    fn remote_command_line(&self, command: &str, working_dir: Option<&str>) -> String {
        let command = match working_dir {
            Some(dir) => format!("cd {} && {}", shell_words::quote(dir), command),
            None => command.to_string(),
        };
        format!(
            "{} -c {}",
            self.options.shell_binary,
            shell_words::quote(&command)
        )
    }
}

/// Remote paths are interpreted by the remote side, so spaces are escaped
/// while glob characters are left alone.
fn escape_remote_path(path: &str) -> String {
    path.replace(' ', "\\ ")
}

#[async_trait]
impl RemoteShell for SshTransport {
    fn user_host(&self) -> &str {
        &self.user_host
    }

    async fn probe(&self) -> Result<CommandOutput, TransportError> {
        let mut args = self.ssh_args();
        args.push("date".to_string());
        let attempts = self.options.access_retry_count + 1;
        let mut last_output = String::new();

        for attempt in 1..=attempts {
            match self.call(&self.options.ssh_program, &args).await {
                Ok(raw) if raw.exit_code == 0 => {
                    return Ok(CommandOutput {
                        exit_code: 0,
                        output: raw.combined(),
                    });
                }
                Ok(raw) => last_output = raw.combined(),
                Err(err @ TransportError::Spawn { .. }) => return Err(err),
                Err(err) => last_output = err.to_string(),
            }
            if attempt < attempts {
                warn!(
                    user_host = %self.user_host,
                    attempt,
                    output = %last_output.trim(),
                    "Remote access not yet available"
                );
                tokio::time::sleep(self.options.access_retry_sleep).await;
            }
        }

        Err(TransportError::AccessFailed {
            user_host: self.user_host.clone(),
            attempts,
            output: last_output,
        })
    }

    async fn shell(
        &self,
        command: &str,
        working_dir: Option<&str>,
    ) -> Result<CommandOutput, TransportError> {
        let mut args = self.ssh_args();
        args.push(self.remote_command_line(command, working_dir));
        self.perform(&self.options.ssh_program, &args, self.options.retry)
            .await
    }

    async fn shell_once(
        &self,
        command: &str,
        working_dir: Option<&str>,
    ) -> Result<CommandOutput, TransportError> {
        let mut args = self.ssh_args();
        args.push(self.remote_command_line(command, working_dir));
        self.perform(&self.options.ssh_program, &args, RetryPolicy::NONE)
            .await
    }

    async fn copy_to(
        &self,
        paths: &[PathBuf],
        remote_dir: Option<&str>,
    ) -> Result<CommandOutput, TransportError> {
        let mut args = self.scp_args();
        args.extend(paths.iter().map(|p| p.display().to_string()));
        args.push(format!(
            "{}:{}",
            self.user_host,
            escape_remote_path(remote_dir.unwrap_or(""))
        ));
        self.perform(&self.options.scp_program, &args, self.options.retry)
            .await
    }

    async fn copy_from(
        &self,
        paths: &[String],
        local_dir: &Path,
    ) -> Result<CommandOutput, TransportError> {
        if !local_dir.is_dir() {
            return Err(TransportError::MissingLocalDir(local_dir.to_path_buf()));
        }

        let mut combined = CommandOutput::default();
        for path in paths {
            let mut args = self.scp_args();
            args.push(format!("{}:{}", self.user_host, escape_remote_path(path)));
            args.push(local_dir.display().to_string());
            let result = self
                .perform(&self.options.scp_program, &args, self.options.retry)
                .await?;
            combined.output.push_str(&result.output);
            if combined.exit_code == 0 {
                combined.exit_code = result.exit_code;
            }
        }
        Ok(combined)
    }
}
