//! Driver-side invocation of the agent through the remote shell.

use crate::errors::{PROTOCOL_FAILURE_EXIT_CODE, PowercycleError, ProtocolError, RemoteCommandError};
use crate::transport::{CommandOutput, RemoteShell};
use powercycle_common::{AgentLayout, HostFamily, RemoteRequest};
use tracing::{debug, info};

/// Flags attached to every request unless the request sets its own.
#[derive(Debug, Clone, Default)]
pub struct AgentDefaults {
    pub task_name: Option<String>,
    pub crash_option: Option<String>,
    pub remote_sudo: bool,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentClient {
    remote_dir: String,
    program: String,
    defaults: AgentDefaults,
}

impl AgentClient {
    pub fn new(layout: &AgentLayout, family: HostFamily, defaults: AgentDefaults) -> Self {
        Self {
            remote_dir: layout.remote_dir.clone(),
            program: format!("{}/{}", layout.remote_dir, family.agent_binary()),
            defaults,
        }
    }

    pub fn remote_dir(&self) -> &str {
        &self.remote_dir
    }

    fn complete(&self, mut request: RemoteRequest) -> RemoteRequest {
        if request.task_name.is_none() {
            request.task_name = self.defaults.task_name.clone();
        }
        if request.crash_option.is_none() {
            request.crash_option = self.defaults.crash_option.clone();
        }
        if request.log_level.is_none() {
            request.log_level = self.defaults.log_level.clone();
        }
        request.remote_sudo |= self.defaults.remote_sudo;
        request
    }

    /// The shell command line for `request`.
    pub fn command_line(&self, request: RemoteRequest) -> String {
        self.complete(request).to_command_line(&self.program)
    }

    /// Run `request` on the agent. Transport failures are returned as
    /// such; the agent's exit code decides between a protocol failure and
    /// a plain remote command failure.
    pub async fn run(
        &self,
        shell: &dyn RemoteShell,
        request: RemoteRequest,
    ) -> Result<CommandOutput, PowercycleError> {
        let operations = operation_names(&request);
        let command = self.command_line(request);
        info!(%operations, "Invoking agent");
        let result = shell.shell(&command, Some(&self.remote_dir)).await?;
        interpret(&operations, &command, result)
    }

    /// Like [`run`](Self::run) without transport retries.
    pub async fn run_once(
        &self,
        shell: &dyn RemoteShell,
        request: RemoteRequest,
    ) -> Result<CommandOutput, PowercycleError> {
        let operations = operation_names(&request);
        let command = self.command_line(request);
        info!(%operations, "Invoking agent once");
        let result = shell.shell_once(&command, Some(&self.remote_dir)).await?;
        interpret(&operations, &command, result)
    }
}

fn operation_names(request: &RemoteRequest) -> String {
    request
        .operations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn interpret(
    operations: &str,
    command: &str,
    result: CommandOutput,
) -> Result<CommandOutput, PowercycleError> {
    for line in result.output.lines() {
        debug!(target: "powercycle::agent_output", "{line}");
    }
    match result.exit_code {
        0 => Ok(result),
        PROTOCOL_FAILURE_EXIT_CODE => Err(ProtocolError::RemoteOperation {
            operation: operations.to_string(),
            output: result.output,
        }
        .into()),
        exit_code => Err(RemoteCommandError {
            command: command.to_string(),
            exit_code,
            output: result.output,
        }
        .into()),
    }
}
