//! Host families and the fixed on-host layout used by the agent.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Port the workload clients use.
pub const STANDARD_PORT: u16 = 27017;
/// Port the server listens on while recovering and being validated. It is
/// kept away from clients so recovery is observed before any new writes.
pub const SECRET_PORT: u16 = 37017;

/// Name of the CI handshake file inside the remote directory.
pub const EXPANSIONS_FILE: &str = "expansions.yml";
/// Name of the uploaded task-profile file inside the remote directory.
pub const TASKS_FILE: &str = "powercycle_tasks.yml";
/// Database and collection holding seed documents and canaries.
pub const DB_NAME: &str = "power";
pub const COLLECTION_NAME: &str = "cycle";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCaps {
    pub test_loops: u32,
    pub num_crud_clients: u32,
    pub num_fsm_clients: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostFamily {
    Linux,
    Windows,
}

impl HostFamily {
    /// The family this binary was built for.
    pub fn current() -> Self {
        if cfg!(windows) {
            HostFamily::Windows
        } else {
            HostFamily::Linux
        }
    }

    /// Classify the output of `uname -s` run on the agent host.
    pub fn from_uname(uname: &str) -> Self {
        let uname = uname.trim().to_ascii_uppercase();
        if uname.contains("CYGWIN") || uname.contains("MINGW") || uname.contains("MSYS") {
            HostFamily::Windows
        } else {
            HostFamily::Linux
        }
    }

    pub fn caps(self) -> Option<HostCaps> {
        match self {
            HostFamily::Linux => None,
            HostFamily::Windows => Some(HostCaps {
                test_loops: 3,
                num_crud_clients: 1,
                num_fsm_clients: 1,
            }),
        }
    }

    pub fn binary_suffix(self) -> &'static str {
        match self {
            HostFamily::Linux => "",
            HostFamily::Windows => ".exe",
        }
    }

    /// Name of the agent executable once uploaded.
    pub fn agent_binary(self) -> String {
        format!("powercycle{}", self.binary_suffix())
    }

    pub fn server_binary(self) -> String {
        format!("mongod{}", self.binary_suffix())
    }

    pub fn core_suffix(self) -> &'static str {
        match self {
            HostFamily::Linux => ".core",
            HostFamily::Windows => ".mdmp",
        }
    }

    pub fn latest_tarball_url(self) -> &'static str {
        match self {
            HostFamily::Linux => "https://fastdl.mongodb.org/linux/mongodb-linux-x86_64-latest.tgz",
            HostFamily::Windows => {
                "https://fastdl.mongodb.org/win32/mongodb-win32-x86_64-2008plus-ssl-latest.zip"
            }
        }
    }

    /// How long the driver waits after an internal crash before trying to
    /// reach the host again.
    pub fn crash_settle_time(self) -> Duration {
        match self {
            HostFamily::Linux => Duration::from_secs(10),
            HostFamily::Windows => Duration::from_secs(30),
        }
    }

    pub fn layout(self) -> AgentLayout {
        match self {
            HostFamily::Linux => AgentLayout::rooted("/log/powercycle", "/data/db"),
            HostFamily::Windows => AgentLayout::rooted("C:/log/powercycle", "C:/data/db"),
        }
    }
}

impl std::fmt::Display for HostFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostFamily::Linux => write!(f, "linux"),
            HostFamily::Windows => write!(f, "windows"),
        }
    }
}

/// Fixed paths on the agent host. All paths use forward slashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLayout {
    pub remote_dir: String,
    pub root_dir: String,
    pub db_path: String,
    pub log_path: String,
    pub monitor_dir: String,
    pub cores_dir: String,
}

impl AgentLayout {
    pub fn rooted(remote_dir: &str, db_path: &str) -> Self {
        Self {
            remote_dir: remote_dir.to_string(),
            root_dir: format!("{remote_dir}/mongodb"),
            db_path: db_path.to_string(),
            log_path: format!("{remote_dir}/log/mongod.log"),
            monitor_dir: format!("{remote_dir}/monitor"),
            cores_dir: format!("{remote_dir}/cores"),
        }
    }

    pub fn expansions_file(&self) -> String {
        format!("{}/{}", self.remote_dir, EXPANSIONS_FILE)
    }

    pub fn tasks_file(&self) -> String {
        format!("{}/{}", self.remote_dir, TASKS_FILE)
    }

    pub fn bin_dir(&self) -> String {
        format!("{}/bin", self.root_dir)
    }

    /// Snapshot of the data directory taken before recovery in `iteration`.
    pub fn backup_before(&self, iteration: u32) -> String {
        format!("{}/data-beforerecovery-{iteration}", self.remote_dir)
    }

    /// Snapshot of the data directory taken after recovery in `iteration`.
    pub fn backup_after(&self, iteration: u32) -> String {
        format!("{}/data-afterrecovery-{iteration}", self.remote_dir)
    }
}
