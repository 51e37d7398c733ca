//! Typed error hierarchy for the powercycle driver.
//!
//! Three kinds of failure are kept apart because the run reacts to them
//! differently:
//! - `TransportError`: the remote shell channel itself failed. Outside the
//!   crash phase this ends the run with an `ec2_ssh_failure` status.
//! - `RemoteCommandError`: the channel worked but the remote command
//!   returned non-zero.
//! - `ProtocolError`: the database server broke a contract (no liveness,
//!   failed validation, missing canary, stale boot time).

use crate::rpc::RpcError;
use thiserror::Error;

/// Exit status the agent uses for protocol failures, so the driver can keep
/// the error kind across the process boundary.
pub const PROTOCOL_FAILURE_EXIT_CODE: i32 = 3;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Remote shell to {user_host} failed with exit code {exit_code}: {output}")]
    Channel {
        user_host: String,
        exit_code: i32,
        output: String,
    },

    #[error("Remote access to {user_host} could not be established after {attempts} attempts: {output}")]
    AccessFailed {
        user_host: String,
        attempts: u32,
        output: String,
    },

    #[error("Local directory {0} does not exist")]
    MissingLocalDir(std::path::PathBuf),
}

impl TransportError {
    /// Captured output of the failed channel, if any.
    pub fn output(&self) -> String {
        match self {
            TransportError::Spawn { source, .. } => source.to_string(),
            TransportError::Channel { output, .. } | TransportError::AccessFailed { output, .. } => {
                output.clone()
            }
            TransportError::MissingLocalDir(path) => path.display().to_string(),
        }
    }

    /// First non-empty output line, as recorded in the exit-status file.
    pub fn first_line(&self) -> String {
        let output = self.output();
        output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.to_string())
    }
}

#[derive(Debug, Error)]
#[error("Remote command '{command}' exited with code {exit_code}: {output}")]
pub struct RemoteCommandError {
    pub command: String,
    pub exit_code: i32,
    pub output: String,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Server on port {port} did not answer isMaster after {attempts} attempts")]
    NotLive { port: u16, attempts: u32 },

    #[error("Server on port {port} never became primary")]
    NotPrimary { port: u16 },

    #[error("Replica set '{repl_set}' reports NotYetInitialized after its first initiation")]
    ReplSetNotInitialized { repl_set: String },

    #[error("Server on port {port} did not acknowledge shutdown: {message}")]
    ShutdownNotAcknowledged { port: u16, message: String },

    #[error("Server did not stop within {timeout_secs}s (state: {state})")]
    StopTimedOut { timeout_secs: u64, state: String },

    #[error("Host boot time did not advance across the crash (before {before}, after {after})")]
    BootTimeNotNewer { before: String, after: String },

    #[error("Crash was requested but did not occur: {output}")]
    CrashNotDelivered { output: String },

    #[error("Canary document {canary} not found after recovery")]
    CanaryMissing { canary: String },

    #[error("Collection validation failed for {}", .0.join(", "))]
    InvalidCollections(Vec<String>),

    #[error("Remote operation '{operation}' failed: {output}")]
    RemoteOperation { operation: String, output: String },

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Any failure that ends a run.
#[derive(Debug, Error)]
pub enum PowercycleError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    RemoteCommand(#[from] RemoteCommandError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PowercycleError {
    pub fn is_transport(&self) -> bool {
        matches!(self, PowercycleError::Transport(_))
    }

    /// Short kind label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PowercycleError::Transport(_) => "transport",
            PowercycleError::RemoteCommand(_) => "remote-command",
            PowercycleError::Protocol(_) => "protocol",
            PowercycleError::Other(_) => "other",
        }
    }
}

impl From<RpcError> for PowercycleError {
    fn from(err: RpcError) -> Self {
        PowercycleError::Protocol(ProtocolError::Rpc(err))
    }
}
