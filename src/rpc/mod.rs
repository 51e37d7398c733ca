//! Server RPC surface.
//!
//! Everything the harness asks of the database server is a command document
//! run against a database (`isMaster`, `validate`, `replSetInitiate`, …).
//! [`ServerRpc`] is that one primitive; the helpers in [`commands`] build the
//! protocol steps on top of it.

pub mod commands;
mod shell;

pub use shell::{MongoShellConnector, MongoShellRpc};

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Both server selection and socket timeouts. Validation of a large data
/// set after recovery can legitimately take this long.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Fragments of client errors that mean the server could not be reached at
/// all, as opposed to a command failing.
pub const NETWORK_ERROR_MARKERS: [&str; 2] = ["couldn't connect to server", "network error"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn local(port: u16) -> Self {
        Self::new("localhost", port)
    }

    pub fn uri(&self, timeout: Duration) -> String {
        let ms = timeout.as_millis();
        format!(
            "mongodb://{}:{}/?serverSelectionTimeoutMS={ms}&socketTimeoutMS={ms}",
            self.host, self.port
        )
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Failed to run the mongo shell: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Could not reach {endpoint}: {output}")]
    Connect { endpoint: String, output: String },

    #[error("Command against {endpoint} timed out after {timeout_secs}s")]
    TimedOut { endpoint: String, timeout_secs: u64 },

    #[error("Command '{command}' failed: {errmsg} ({code_name})")]
    Command {
        command: String,
        code: Option<i64>,
        code_name: String,
        errmsg: String,
    },

    #[error("Malformed reply from the mongo shell: {output}")]
    Malformed { output: String },
}

impl RpcError {
    /// True when the server was unreachable rather than refusing a command.
    pub fn is_network_error(&self) -> bool {
        match self {
            RpcError::Connect { .. } => true,
            RpcError::Command { errmsg, .. } => {
                NETWORK_ERROR_MARKERS.iter().any(|m| errmsg.contains(m))
            }
            _ => false,
        }
    }

    pub fn code_name(&self) -> Option<&str> {
        match self {
            RpcError::Command { code_name, .. } => Some(code_name),
            _ => None,
        }
    }
}

#[async_trait]
pub trait ServerRpc: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    /// Run `command` against database `db` and return the reply. Replies
    /// without `ok: 1` are turned into [`RpcError::Command`].
    async fn run_command(&self, db: &str, command: Value) -> Result<Value, RpcError>;
}

/// Opens RPC sessions to a server.
pub trait RpcConnector: Send + Sync {
    fn connect(&self, endpoint: Endpoint) -> Box<dyn ServerRpc>;
}

/// Check a raw reply for `ok: 1`.
pub fn check_reply(command: &Value, reply: Value) -> Result<Value, RpcError> {
    let ok = match reply.get("ok") {
        Some(Value::Number(n)) => n.as_f64() == Some(1.0),
        Some(Value::Bool(b)) => *b,
        _ => false,
    };
    if ok {
        return Ok(reply);
    }
    Err(RpcError::Command {
        command: command_name(command),
        code: reply.get("code").and_then(Value::as_i64),
        code_name: reply
            .get("codeName")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string(),
        errmsg: reply
            .get("errmsg")
            .and_then(Value::as_str)
            .unwrap_or("no error message")
            .to_string(),
    })
}

/// First key of a command document, which names the command.
pub fn command_name(command: &Value) -> String {
    command
        .as_object()
        .and_then(|doc| doc.keys().next())
        .cloned()
        .unwrap_or_else(|| "<unknown>".to_string())
}
