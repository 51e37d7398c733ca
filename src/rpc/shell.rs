//! [`ServerRpc`] over the `mongo` shell.
//!
//! Each command becomes a tiny script: run the command document, catch any
//! shell exception, and print the reply as JSON behind a marker so log noise
//! from the shell can't be mistaken for the reply.

use super::{Endpoint, RPC_TIMEOUT, RpcConnector, RpcError, ServerRpc, check_reply};
use async_trait::async_trait;
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const REPLY_MARKER: &str = "__powercycle_reply__:";

pub struct MongoShellRpc {
    mongo_path: PathBuf,
    endpoint: Endpoint,
    timeout: Duration,
}

impl MongoShellRpc {
    pub fn new(mongo_path: impl Into<PathBuf>, endpoint: Endpoint) -> Self {
        Self {
            mongo_path: mongo_path.into(),
            endpoint,
            timeout: RPC_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn script(db: &str, command: &Value) -> String {
        let db = Value::String(db.to_string());
        format!(
            "var reply;\n\
             try {{\n    reply = db.getSiblingDB({db}).runCommand({command});\n}} catch (e) {{\n    \
             reply = {{ok: 0, codeName: \"ShellException\", errmsg: String(e)}};\n}}\n\
             print(\"{REPLY_MARKER}\" + JSON.stringify(reply));\n"
        )
    }

    fn parse_output(&self, exit_code: i32, output: &str) -> Result<Value, RpcError> {
        let reply_line = output
            .lines()
            .rev()
            .find_map(|line| line.trim().strip_prefix(REPLY_MARKER));
        match reply_line {
            Some(json) => serde_json::from_str(json).map_err(|_| RpcError::Malformed {
                output: output.to_string(),
            }),
            None if exit_code != 0 => Err(RpcError::Connect {
                endpoint: self.endpoint.to_string(),
                output: output.trim().to_string(),
            }),
            None => Err(RpcError::Malformed {
                output: output.to_string(),
            }),
        }
    }
}

#[async_trait]
impl ServerRpc for MongoShellRpc {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn run_command(&self, db: &str, command: Value) -> Result<Value, RpcError> {
        let mut script = tempfile::Builder::new()
            .prefix("powercycle-rpc-")
            .suffix(".js")
            .tempfile()
            .map_err(RpcError::Spawn)?;
        script
            .write_all(Self::script(db, &command).as_bytes())
            .map_err(RpcError::Spawn)?;

        debug!(endpoint = %self.endpoint, command = %command, "Running server command");
        let child = Command::new(&self.mongo_path)
            .arg("--quiet")
            .arg("--norc")
            .arg(self.endpoint.uri(self.timeout))
            .arg(script.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(result) => result.map_err(RpcError::Spawn)?,
            Err(_) => {
                return Err(RpcError::TimedOut {
                    endpoint: self.endpoint.to_string(),
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let reply = self.parse_output(output.status.code().unwrap_or(-1), &text)?;
        check_reply(&command, reply)
    }
}

/// Opens [`MongoShellRpc`] sessions with a fixed shell binary.
#[derive(Debug, Clone)]
pub struct MongoShellConnector {
    mongo_path: PathBuf,
    timeout: Duration,
}

impl MongoShellConnector {
    pub fn new(mongo_path: impl Into<PathBuf>) -> Self {
        Self {
            mongo_path: mongo_path.into(),
            timeout: RPC_TIMEOUT,
        }
    }
}

impl RpcConnector for MongoShellConnector {
    fn connect(&self, endpoint: Endpoint) -> Box<dyn ServerRpc> {
        Box::new(MongoShellRpc::new(&self.mongo_path, endpoint).with_timeout(self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;
    use tempfile::tempdir;

    fn create_test_script(dir: &Path, name: &str, content: &str) -> PathBuf {
        let script_path = dir.join(name);
        std::fs::write(&script_path, content).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script_path, perms).unwrap();
        }
        script_path
    }

    #[test]
    fn test_script_embeds_command_and_db() {
        let script = MongoShellRpc::script("admin", &json!({"isMaster": 1}));
        assert!(script.contains(r#"db.getSiblingDB("admin").runCommand({"isMaster":1})"#));
        assert!(script.contains(REPLY_MARKER));
    }

    #[test]
    fn test_parse_output_skips_noise() {
        let rpc = MongoShellRpc::new("mongo", Endpoint::local(27017));
        let output = format!("some warning\n{REPLY_MARKER}{{\"ok\":1,\"ismaster\":true}}\n");
        let reply = rpc.parse_output(0, &output).unwrap();
        assert_eq!(reply["ismaster"], json!(true));
    }

    #[test]
    fn test_parse_output_without_reply_on_failure_is_connect_error() {
        let rpc = MongoShellRpc::new("mongo", Endpoint::local(27017));
        let err = rpc
            .parse_output(1, "Error: couldn't connect to server localhost:27017")
            .unwrap_err();
        assert!(err.is_network_error());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_with_fake_shell() {
        let dir = tempdir().unwrap();
        let mongo = create_test_script(
            dir.path(),
            "mongo",
            &format!("#!/bin/sh\necho 'MongoDB shell noise'\necho '{REPLY_MARKER}{{\"ok\":1,\"n\":1}}'\n"),
        );
        let rpc = MongoShellRpc::new(&mongo, Endpoint::local(27017));
        let reply = rpc
            .run_command("power", json!({"insert": "cycle", "documents": [{"x": 1}]}))
            .await
            .unwrap();
        assert_eq!(reply["n"], json!(1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_surfaces_command_failure() {
        let dir = tempdir().unwrap();
        let mongo = create_test_script(
            dir.path(),
            "mongo",
            &format!(
                "#!/bin/sh\necho '{REPLY_MARKER}{{\"ok\":0,\"code\":26,\"codeName\":\"NamespaceNotFound\",\"errmsg\":\"ns not found\"}}'\n"
            ),
        );
        let rpc = MongoShellRpc::new(&mongo, Endpoint::local(27017));
        let err = rpc
            .run_command("power", json!({"validate": "gone", "full": true}))
            .await
            .unwrap_err();
        assert_eq!(err.code_name(), Some("NamespaceNotFound"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_times_out() {
        let dir = tempdir().unwrap();
        let mongo = create_test_script(dir.path(), "mongo", "#!/bin/sh\nsleep 5\n");
        let rpc = MongoShellRpc::new(&mongo, Endpoint::local(27017))
            .with_timeout(Duration::from_millis(100));
        let err = rpc.run_command("admin", json!({"shutdown": 1})).await.unwrap_err();
        assert!(matches!(err, RpcError::TimedOut { .. }));
    }
}
