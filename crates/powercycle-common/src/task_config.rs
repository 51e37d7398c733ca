//! Task profiles.
//!
//! A run is parameterised by one named profile looked up in a YAML file:
//!
//! ```yaml
//! tasks:
//!   - name: powercycle
//!   - name: powercycle_kill_mongod
//!     crash_method: kill
//!   - name: powercycle_replication_majority
//!     repl_set: powercycle
//!     write_concern: "{w: majority, j: true}"
//!     read_concern_level: majority
//! ```
//!
//! CI-generated task names carry suffixes such as `powercycle_smoke_0` or
//! `powercycle_smoke_2_linux-64`; those are stripped when the exact name
//! is not found.

use crate::layout::HostCaps;
use crate::mongod_options::{MongodOptions, OptionsError};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

static TASK_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(_[0-9]+)(_[\w-]+)?$").expect("valid task suffix regex"));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read task profiles at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse task profiles: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("no task profile named '{name}' (also tried '{stripped}')")]
    UnknownTask { name: String, stripped: String },

    #[error("invalid task profile '{task}': {message}")]
    Invalid { task: String, message: String },

    #[error("invalid mongod_options for task '{task}': {source}")]
    Options {
        task: String,
        #[source]
        source: OptionsError,
    },
}

/// How the server is taken down at the end of each iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrashMethod {
    /// Hard-reset the host kernel.
    #[default]
    Internal,
    /// SIGKILL the server process only.
    Kill,
}

impl std::fmt::Display for CrashMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrashMethod::Internal => write!(f, "internal"),
            CrashMethod::Kill => write!(f, "kill"),
        }
    }
}

impl std::str::FromStr for CrashMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "internal" => Ok(CrashMethod::Internal),
            "kill" => Ok(CrashMethod::Kill),
            _ => anyhow::bail!("Invalid crash method '{}'. Valid values: internal, kill", s),
        }
    }
}

fn default_test_loops() -> u32 {
    15
}

fn default_seed_doc_num() -> u64 {
    10_000
}

fn default_num_crud_clients() -> u32 {
    10
}

fn default_num_fsm_clients() -> u32 {
    10
}

/// One named task profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    #[serde(default)]
    pub crash_method: CrashMethod,
    #[serde(default = "default_test_loops")]
    pub test_loops: u32,
    #[serde(default = "default_seed_doc_num")]
    pub seed_doc_num: u64,
    /// Write concern handed to the workload clients.
    #[serde(default, deserialize_with = "deserialize_write_concern")]
    pub write_concern: Map<String, Value>,
    #[serde(default)]
    pub read_concern_level: Option<String>,
    /// Feature compatibility version applied once, on the first iteration.
    #[serde(default)]
    pub fcv: Option<String>,
    #[serde(default)]
    pub repl_set: Option<String>,
    /// Shell-quoted extra server options.
    #[serde(default)]
    pub mongod_options: String,
    #[serde(default = "default_num_crud_clients")]
    pub num_crud_clients: u32,
    #[serde(default = "default_num_fsm_clients")]
    pub num_fsm_clients: u32,
}

/// `write_concern` is usually a YAML mapping written as a string; an inline
/// mapping is accepted too.
fn deserialize_write_concern<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Mapping(Map<String, Value>),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(Map::new()),
        Some(Raw::Mapping(map)) => Ok(map),
        Some(Raw::Text(text)) if text.trim().is_empty() => Ok(Map::new()),
        Some(Raw::Text(text)) => match serde_yaml::from_str::<Value>(&text).map_err(D::Error::custom)? {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Map::new()),
            other => Err(D::Error::custom(format!(
                "write_concern must be a mapping, got {other}"
            ))),
        },
    }
}

impl TaskConfig {
    /// A profile with every default, used when building one by hand.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            crash_method: CrashMethod::default(),
            test_loops: default_test_loops(),
            seed_doc_num: default_seed_doc_num(),
            write_concern: Map::new(),
            read_concern_level: None,
            fcv: None,
            repl_set: None,
            mongod_options: String::new(),
            num_crud_clients: default_num_crud_clients(),
            num_fsm_clients: default_num_fsm_clients(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.test_loops == 0 {
            return Err(ConfigError::Invalid {
                task: self.name.clone(),
                message: "test_loops must be at least 1".to_string(),
            });
        }
        self.server_options()?;
        Ok(())
    }

    pub fn server_options(&self) -> Result<MongodOptions, ConfigError> {
        MongodOptions::parse(&self.mongod_options).map_err(|source| ConfigError::Options {
            task: self.name.clone(),
            source,
        })
    }

    /// Read concern the workload clients use. Falls back to `local` when
    /// only a write concern is configured.
    pub fn effective_read_concern(&self) -> Option<String> {
        match &self.read_concern_level {
            Some(level) => Some(level.clone()),
            None if !self.write_concern.is_empty() => Some("local".to_string()),
            None => None,
        }
    }

    /// False when acknowledged writes may be lost on a crash: journaling
    /// disabled on the server, `j: false`, or `w: 0`.
    pub fn guarantees_durability(&self) -> bool {
        let nojournal = self
            .server_options()
            .map(|opts| opts.has("nojournal"))
            .unwrap_or(false);
        let journal_off = self.write_concern.get("j") == Some(&Value::Bool(false));
        let unacknowledged = self
            .write_concern
            .get("w")
            .and_then(Value::as_i64)
            .is_some_and(|w| w == 0);
        !(nojournal || journal_off || unacknowledged)
    }

    /// Clamp loop and client counts to a host family's caps.
    pub fn capped(mut self, caps: Option<HostCaps>) -> Self {
        if let Some(caps) = caps {
            self.test_loops = self.test_loops.min(caps.test_loops);
            self.num_crud_clients = self.num_crud_clients.min(caps.num_crud_clients);
            self.num_fsm_clients = self.num_fsm_clients.min(caps.num_fsm_clients);
        }
        self
    }
}

/// Strip a trailing `_<number>` (optionally followed by `_<word>`) from a
/// CI task name.
pub fn strip_task_suffix(name: &str) -> String {
    TASK_SUFFIX.replace(name, "").into_owned()
}

/// The parsed task-profile file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskProfiles {
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

impl TaskProfiles {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Look up a profile by exact name, then by suffix-stripped name.
    pub fn resolve(&self, task_name: &str) -> Result<TaskConfig, ConfigError> {
        let stripped = strip_task_suffix(task_name);
        let found = self
            .tasks
            .iter()
            .find(|t| t.name == task_name)
            .or_else(|| self.tasks.iter().find(|t| t.name == stripped))
            .cloned()
            .ok_or_else(|| ConfigError::UnknownTask {
                name: task_name.to_string(),
                stripped: stripped.clone(),
            })?;
        found.validate()?;
        Ok(found)
    }
}
