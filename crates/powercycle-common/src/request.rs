//! The request the driver sends to the agent through the remote shell.
//!
//! A [`RemoteRequest`] is rendered into the agent's own command line by
//! [`RemoteRequest::to_args`] and parsed back by the agent's CLI into the
//! same value.

use serde::{Deserialize, Serialize};

/// Every verb the agent understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteOperation {
    Noop,
    CrashServer,
    KillMongod,
    InstallMongod,
    StartMongod,
    StopMongod,
    ShutdownMongod,
    RsyncData,
    SeedDocs,
    SetFcv,
    CheckDisk,
}

impl RemoteOperation {
    pub const ALL: [RemoteOperation; 11] = [
        RemoteOperation::Noop,
        RemoteOperation::CrashServer,
        RemoteOperation::KillMongod,
        RemoteOperation::InstallMongod,
        RemoteOperation::StartMongod,
        RemoteOperation::StopMongod,
        RemoteOperation::ShutdownMongod,
        RemoteOperation::RsyncData,
        RemoteOperation::SeedDocs,
        RemoteOperation::SetFcv,
        RemoteOperation::CheckDisk,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RemoteOperation::Noop => "noop",
            RemoteOperation::CrashServer => "crash_server",
            RemoteOperation::KillMongod => "kill_mongod",
            RemoteOperation::InstallMongod => "install_mongod",
            RemoteOperation::StartMongod => "start_mongod",
            RemoteOperation::StopMongod => "stop_mongod",
            RemoteOperation::ShutdownMongod => "shutdown_mongod",
            RemoteOperation::RsyncData => "rsync_data",
            RemoteOperation::SeedDocs => "seed_docs",
            RemoteOperation::SetFcv => "set_fcv",
            RemoteOperation::CheckDisk => "check_disk",
        }
    }
}

impl std::fmt::Display for RemoteOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RemoteOperation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RemoteOperation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<_> = RemoteOperation::ALL.iter().map(|op| op.as_str()).collect();
                anyhow::anyhow!(
                    "Invalid remote operation '{}'. Valid values: {}",
                    s,
                    valid.join(", ")
                )
            })
    }
}

/// Source and destination of a data-directory snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsyncDest {
    pub src_dir: String,
    pub new_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRequest {
    /// Verbs executed in order; the first failure stops the rest.
    pub operations: Vec<RemoteOperation>,
    pub task_name: Option<String>,
    pub mongod_host: Option<String>,
    pub mongod_port: Option<u16>,
    pub rsync_dest: Option<RsyncDest>,
    pub download_url: Option<String>,
    pub crash_option: Option<String>,
    pub remote_sudo: bool,
    pub log_level: Option<String>,
}

impl RemoteRequest {
    pub fn new(operation: RemoteOperation) -> Self {
        Self {
            operations: vec![operation],
            task_name: None,
            mongod_host: None,
            mongod_port: None,
            rsync_dest: None,
            download_url: None,
            crash_option: None,
            remote_sudo: false,
            log_level: None,
        }
    }

    pub fn then(mut self, operation: RemoteOperation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn task_name(mut self, task_name: impl Into<String>) -> Self {
        self.task_name = Some(task_name.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.mongod_port = Some(port);
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.mongod_host = Some(host.into());
        self
    }

    pub fn rsync(mut self, src_dir: impl Into<String>, new_dir: impl Into<String>) -> Self {
        self.rsync_dest = Some(RsyncDest {
            src_dir: src_dir.into(),
            new_dir: new_dir.into(),
        });
        self
    }

    pub fn contains(&self, operation: RemoteOperation) -> bool {
        self.operations.contains(&operation)
    }

    /// The agent command-line arguments for this request. The first verb is
    /// passed with `--remoteOperation`, the rest are trailing positionals.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let mut operations = self.operations.iter();
        if let Some(first) = operations.next() {
            args.push("--remoteOperation".to_string());
            args.push(first.to_string());
        }
        let mut flag = |name: &str, value: &str| {
            args.push(format!("--{name}"));
            args.push(value.to_string());
        };
        if let Some(v) = &self.task_name {
            flag("taskName", v);
        }
        if let Some(v) = &self.mongod_host {
            flag("mongodHost", v);
        }
        if let Some(v) = self.mongod_port {
            flag("mongodPort", &v.to_string());
        }
        if let Some(v) = &self.download_url {
            flag("downloadUrl", v);
        }
        if let Some(v) = &self.crash_option {
            flag("crashOption", v);
        }
        if let Some(v) = &self.log_level {
            flag("logLevel", v);
        }
        if let Some(dest) = &self.rsync_dest {
            args.push("--rsyncDest".to_string());
            args.push(dest.src_dir.clone());
            args.push(dest.new_dir.clone());
        }
        if self.remote_sudo {
            args.push("--remoteSudo".to_string());
        }
        args.extend(operations.map(ToString::to_string));
        args
    }

    /// Full shell command line invoking `program` with this request.
    pub fn to_command_line(&self, program: &str) -> String {
        let mut words = vec![program.to_string()];
        words.extend(self.to_args());
        shell_words::join(words)
    }
}
