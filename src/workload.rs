//! Workload fleet: CRUD and FSM client processes hammering the server on
//! its standard port while the crash is pending.
//!
//! Each client is a resmoke run with its own suite file, derived from the
//! external-server suite with the client's `TestData` swapped in. Suite
//! files live in the run's temp registry; the processes in its process
//! registry.

use crate::context::RunContext;
use crate::rpc::Endpoint;
use anyhow::{Context, Result};
use powercycle_common::TaskConfig;
use powercycle_common::layout::DB_NAME;
use serde_yaml::{Mapping, Value};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

pub const BASE_SUITE: &str = "buildscripts/resmokeconfig/suites/with_external_server.yml";
const CRUD_CLIENT_JS: &str = "jstests/hooks/crud_client.js";
const FSM_CLIENT_JS: &str = "jstests/libs/fsm_serial_client.js";
const CONCERNS_OVERRIDE: &str =
    "load('jstests/libs/override_methods/set_read_and_write_concerns.js');";
const REPEAT: &str = "100";

#[derive(Debug, Clone)]
pub struct WorkloadSettings {
    pub python: PathBuf,
    pub mongo_repo_root_dir: PathBuf,
    pub mongo_path: PathBuf,
    /// Where `crud_<i>.log` and `fsm_<i>.log` are written.
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Crud,
    Fsm,
}

impl ClientKind {
    fn label(self) -> &'static str {
        match self {
            ClientKind::Crud => "crud",
            ClientKind::Fsm => "fsm",
        }
    }

    fn script(self) -> &'static str {
        match self {
            ClientKind::Crud => CRUD_CLIENT_JS,
            ClientKind::Fsm => FSM_CLIENT_JS,
        }
    }
}

/// `TestData` for client `index` of `kind`.
pub fn test_data(kind: ClientKind, index: u32, task: &TaskConfig) -> Mapping {
    let mut data = Mapping::new();
    match kind {
        ClientKind::Crud => {
            data.insert("dbName".into(), DB_NAME.into());
            data.insert("collectionName".into(), format!("cycle-{index}").into());
        }
        ClientKind::Fsm => {
            data.insert("dbNamePrefix".into(), format!("fsm-{index}").into());
            data.insert(
                "fsmDbBlacklist".into(),
                Value::Sequence(vec![DB_NAME.into()]),
            );
            data.insert("validateCollections".into(), (index == 0).into());
        }
    }
    if !task.write_concern.is_empty() {
        match serde_yaml::to_value(&task.write_concern) {
            Ok(concern) => {
                data.insert("defaultWriteConcern".into(), concern);
            }
            Err(err) => warn!(error = %err, "Write concern not representable in YAML"),
        }
    }
    if let Some(level) = task.effective_read_concern() {
        data.insert("defaultReadConcernLevel".into(), level.into());
    }
    data
}

/// Mutable child mapping at `key`, replacing anything that isn't one.
fn child<'a>(map: &'a mut Mapping, key: &str) -> &'a mut Mapping {
    let slot = map
        .entry(key.into())
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if !slot.is_mapping() {
        *slot = Value::Mapping(Mapping::new());
    }
    match slot {
        Value::Mapping(m) => m,
        _ => unreachable!("slot was just made a mapping"),
    }
}

/// Base suite with `executor.config.shell_options` rewritten for one client.
pub fn client_suite(base: &str, data: Mapping, with_concerns: bool) -> Result<String> {
    let mut suite: Value = serde_yaml::from_str(base).context("Failed to parse base suite")?;
    if !suite.is_mapping() {
        suite = Value::Mapping(Mapping::new());
    }
    let Value::Mapping(root) = &mut suite else {
        unreachable!("suite is a mapping");
    };
    let shell_options = child(child(child(root, "executor"), "config"), "shell_options");
    child(shell_options, "global_vars").insert("TestData".into(), Value::Mapping(data));
    if with_concerns {
        shell_options.insert("eval".into(), CONCERNS_OVERRIDE.into());
    }
    serde_yaml::to_string(&suite).context("Failed to serialize client suite")
}

pub struct WorkloadFleet {
    settings: WorkloadSettings,
}

impl WorkloadFleet {
    pub fn new(settings: WorkloadSettings) -> Self {
        Self { settings }
    }

    /// Spawn every client of `task` against `endpoint`. Returns how many
    /// were started.
    pub fn start(&self, ctx: &mut RunContext, task: &TaskConfig, endpoint: &Endpoint) -> Result<u32> {
        let total = task.num_crud_clients + task.num_fsm_clients;
        if total == 0 {
            info!("No workload clients configured");
            return Ok(0);
        }
        let base_path = self.settings.mongo_repo_root_dir.join(BASE_SUITE);
        let base = std::fs::read_to_string(&base_path)
            .with_context(|| format!("Failed to read {}", base_path.display()))?;
        let with_concerns =
            !task.write_concern.is_empty() || task.read_concern_level.is_some();

        for (kind, count) in [
            (ClientKind::Crud, task.num_crud_clients),
            (ClientKind::Fsm, task.num_fsm_clients),
        ] {
            for index in 0..count {
                let suite = client_suite(&base, test_data(kind, index, task), with_concerns)?;
                let suite_path =
                    ctx.temp_files
                        .create(&format!("{}-{index}-", kind.label()), ".yml", suite.as_bytes())?;
                let command = self.command(kind, index, &suite_path, endpoint)?;
                let pid = ctx.processes.spawn(command)?;
                info!(client = kind.label(), index, pid, "Workload client started");
            }
        }
        Ok(total)
    }

    fn command(
        &self,
        kind: ClientKind,
        index: u32,
        suite_path: &Path,
        endpoint: &Endpoint,
    ) -> Result<Command> {
        let log_path = self
            .settings
            .log_dir
            .join(format!("{}_{index}.log", kind.label()));
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open {}", log_path.display()))?;
        let err_log = log
            .try_clone()
            .with_context(|| format!("Failed to clone {}", log_path.display()))?;

        let mut command = Command::new(&self.settings.python);
        command
            .current_dir(&self.settings.mongo_repo_root_dir)
            .arg("buildscripts/resmoke.py")
            .arg("run")
            .arg("--suites")
            .arg(suite_path)
            .arg("--mongo")
            .arg(&self.settings.mongo_path)
            .arg("--shellConnString")
            .arg(format!("mongodb://{endpoint}"))
            .arg("--continueOnFailure")
            .arg("--repeat")
            .arg(REPEAT)
            .arg(kind.script())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(err_log));
        Ok(command)
    }

    /// Kill every client and delete every suite file.
    pub async fn drain(ctx: &mut RunContext) {
        let clients = ctx.processes.len();
        ctx.processes.drain().await;
        let files = ctx.temp_files.delete_all();
        info!(clients, files, "Workload drained");
    }
}
