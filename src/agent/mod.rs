//! The agent: the target-host side of the harness.
//!
//! The driver invokes the uploaded binary with `--remoteOperation` and a
//! [`RemoteRequest`]; [`Agent::run`] executes the verbs in order and stops
//! at the first failure. The process exit code carries the failure kind
//! back to the driver (see [`exit_code`]).

pub mod client;

pub use client::{AgentClient, AgentDefaults};

use crate::errors::{PROTOCOL_FAILURE_EXIT_CODE, PowercycleError, ProtocolError, RemoteCommandError};
use crate::rpc::commands;
use crate::rpc::{Endpoint, MongoShellConnector, RpcConnector};
use crate::supervisor::{HostPlatform, ServerInstance, Supervisor, install, platform_for};
use anyhow::{Context, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};
use powercycle_common::layout::{COLLECTION_NAME, DB_NAME};
use powercycle_common::{
    AgentLayout, HostFamily, RemoteOperation, RemoteRequest, STANDARD_PORT, TaskConfig, TaskProfiles,
};
use regex::Regex;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tokio::process::Command;
use tracing::{info, warn};

/// Crash utility used on Windows hosts when nothing else is configured.
pub const DEFAULT_WINDOWS_CRASH_CMD: &str = "notmyfault/notmyfaultc64.exe -accepteula crash 1";

/// How long the agent waits for an internal crash to take the host down.
const CRASH_GRACE: std::time::Duration = std::time::Duration::from_secs(30);

const BOOT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

static BOOT_TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"last booted (.*), up").expect("valid regex"));

/// The line every agent invocation logs first.
pub fn boot_time_line(boot: DateTime<Utc>, now: DateTime<Utc>) -> String {
    format!(
        "System was last booted {}, up {} seconds",
        boot.format(BOOT_TIME_FORMAT),
        (now - boot).num_seconds().max(0)
    )
}

/// Extract the boot time from agent output.
pub fn parse_boot_time(output: &str) -> Option<NaiveDateTime> {
    let captures = BOOT_TIME_RE.captures(output)?;
    NaiveDateTime::parse_from_str(captures.get(1)?.as_str().trim(), BOOT_TIME_FORMAT).ok()
}

/// Process exit code for the outcome of a run.
pub fn exit_code(result: &Result<(), PowercycleError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(PowercycleError::Protocol(_)) => PROTOCOL_FAILURE_EXIT_CODE,
        Err(_) => 1,
    }
}

/// The CI handshake file.
#[derive(Debug, Clone, Default)]
pub struct Expansions(BTreeMap<String, serde_yaml::Value>);

impl Expansions {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Err(anyhow!(
                "Expansions file {} not found, refusing to run",
                path.display()
            ));
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let map: Option<BTreeMap<String, serde_yaml::Value>> = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Self(map.unwrap_or_default()))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            serde_yaml::Value::String(s) => Some(s.clone()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            serde_yaml::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Mongo shell shipped with the server, falling back to `mongosh` on PATH.
fn shell_binary(bin_dir: &Path, family: HostFamily) -> PathBuf {
    let bundled = bin_dir.join(format!("mongo{}", family.binary_suffix()));
    if bundled.exists() {
        bundled
    } else {
        PathBuf::from(format!("mongosh{}", family.binary_suffix()))
    }
}

/// Path in the form the host's rsync understands.
fn rsync_path(family: HostFamily, path: &str) -> String {
    match family {
        HostFamily::Linux => path.to_string(),
        HostFamily::Windows => {
            let bytes = path.as_bytes();
            if bytes.len() >= 2 && bytes[1] == b':' {
                format!(
                    "/cygdrive/{}{}",
                    path[..1].to_ascii_lowercase(),
                    path[2..].replace('\\', "/")
                )
            } else {
                path.replace('\\', "/")
            }
        }
    }
}

pub struct Agent {
    request: RemoteRequest,
    layout: AgentLayout,
    family: HostFamily,
    expansions: Expansions,
    platform: Arc<dyn HostPlatform>,
    connector: Arc<dyn RpcConnector>,
}

impl Agent {
    /// Agent for this host. Fails when the expansions file is missing.
    pub fn load(request: RemoteRequest, layout: AgentLayout) -> anyhow::Result<Self> {
        let expansions = Expansions::load(Path::new(&layout.expansions_file()))?;
        let family = HostFamily::current();
        let connector = Arc::new(MongoShellConnector::new(shell_binary(
            Path::new(&layout.bin_dir()),
            family,
        )));
        Ok(Self::with_parts(
            request,
            layout,
            family,
            expansions,
            Arc::from(platform_for(family)),
            connector,
        ))
    }

    pub fn with_parts(
        request: RemoteRequest,
        layout: AgentLayout,
        family: HostFamily,
        expansions: Expansions,
        platform: Arc<dyn HostPlatform>,
        connector: Arc<dyn RpcConnector>,
    ) -> Self {
        Self {
            request,
            layout,
            family,
            expansions,
            platform,
            connector,
        }
    }

    fn port(&self) -> u16 {
        self.request.mongod_port.unwrap_or(STANDARD_PORT)
    }

    fn task(&self) -> Result<TaskConfig, PowercycleError> {
        let name = self
            .request
            .task_name
            .clone()
            .or_else(|| self.expansions.get("task_name"))
            .ok_or_else(|| anyhow!("No task name given and none in the expansions file"))?;
        let profiles = TaskProfiles::load(Path::new(&self.layout.tasks_file()))
            .map_err(|err| PowercycleError::Other(err.into()))?;
        profiles
            .resolve(&name)
            .map_err(|err| PowercycleError::Other(err.into()))
    }

    fn supervisor(&self, task: &TaskConfig) -> Result<Supervisor, PowercycleError> {
        let instance = ServerInstance::new(self.family, &self.layout, task, self.port())?;
        Ok(Supervisor::new(
            self.platform.clone(),
            instance,
            self.connector.clone(),
        ))
    }

    /// Supervisor for verbs that only stop or inspect the server.
    fn control_supervisor(&self) -> Result<Supervisor, PowercycleError> {
        self.supervisor(&TaskConfig::named("control"))
    }

    /// Write the boot-time line to `out`, whatever the log level. The
    /// driver reads the host's boot time from it.
    pub fn announce_boot(&self, out: &mut dyn Write) {
        let boot = match self.platform.boot_time() {
            Ok(boot) => boot,
            Err(err) => {
                warn!(error = %err, "Could not determine boot time");
                return;
            }
        };
        let line = boot_time_line(boot, Utc::now());
        if let Err(err) = writeln!(out, "{line}").and_then(|()| out.flush()) {
            warn!(error = %err, "Could not write boot time");
        }
    }

    pub async fn run(&self) -> Result<(), PowercycleError> {
        self.announce_boot(&mut std::io::stdout().lock());
        for &operation in &self.request.operations {
            info!(%operation, "Running remote operation");
            if let Err(err) = self.dispatch(operation).await {
                warn!(%operation, kind = err.kind(), error = %err, "Remote operation failed");
                return Err(err);
            }
        }
        Ok(())
    }

    async fn dispatch(&self, operation: RemoteOperation) -> Result<(), PowercycleError> {
        match operation {
            RemoteOperation::Noop => Ok(()),
            RemoteOperation::CrashServer => self.crash_server().await,
            RemoteOperation::KillMongod => self.control_supervisor()?.kill().await,
            RemoteOperation::InstallMongod => self.install_mongod().await,
            RemoteOperation::StartMongod => self.start_mongod().await,
            RemoteOperation::StopMongod => self.control_supervisor()?.stop().await,
            RemoteOperation::ShutdownMongod => self.control_supervisor()?.shutdown().await,
            RemoteOperation::RsyncData => self.rsync_data().await,
            RemoteOperation::SeedDocs => self.seed_docs().await,
            RemoteOperation::SetFcv => self.set_fcv().await,
            RemoteOperation::CheckDisk => self.check_disk().await,
        }
    }

    async fn crash_server(&self) -> Result<(), PowercycleError> {
        let command = match self.family {
            HostFamily::Windows => Some(
                self.request
                    .crash_option
                    .clone()
                    .or_else(|| self.expansions.get("windows_crash_cmd"))
                    .unwrap_or_else(|| DEFAULT_WINDOWS_CRASH_CMD.to_string()),
            ),
            HostFamily::Linux => self.request.crash_option.clone(),
        };
        let output = self
            .platform
            .crash_internal(command.as_deref(), self.request.remote_sudo)
            .await?;
        tokio::time::sleep(CRASH_GRACE).await;
        Err(ProtocolError::CrashNotDelivered { output }.into())
    }

    async fn install_mongod(&self) -> Result<(), PowercycleError> {
        let url = match self.request.download_url.as_deref() {
            None | Some("latest") => self.family.latest_tarball_url().to_string(),
            Some(url) => url.to_string(),
        };
        install::install_server(Path::new(&self.layout.root_dir), &url, &self.family.server_binary())
            .await?;
        install::prepare_dirs(Path::new(&self.layout.db_path), Path::new(&self.layout.log_path))?;
        let task = self.task().unwrap_or_else(|_| TaskConfig::named("control"));
        let instance = ServerInstance::new(self.family, &self.layout, &task, self.port())?;
        self.platform.install(&instance).await?;
        Ok(())
    }

    async fn start_mongod(&self) -> Result<(), PowercycleError> {
        let task = self.task()?;
        install::prepare_dirs(Path::new(&self.layout.db_path), Path::new(&self.layout.log_path))?;
        let host = self.request.mongod_host.as_deref().unwrap_or("localhost");
        let host_port = format!("{host}:{}", self.port());
        self.supervisor(&task)?
            .start(task.repl_set.as_deref(), &host_port)
            .await?;
        Ok(())
    }

    async fn rsync_data(&self) -> Result<(), PowercycleError> {
        let dest = self
            .request
            .rsync_dest
            .as_ref()
            .ok_or_else(|| anyhow!("rsync_data requires --rsyncDest"))?;
        let args = [
            "-va".to_string(),
            "--delete".to_string(),
            "--quiet".to_string(),
            "--exclude".to_string(),
            "diagnostic.data/metrics.interim*".to_string(),
            rsync_path(self.family, &self.layout.db_path),
            rsync_path(self.family, &dest.src_dir),
        ];
        run_local("rsync", &args).await?;
        if dest.src_dir != dest.new_dir {
            std::fs::rename(&dest.src_dir, &dest.new_dir)
                .with_context(|| format!("Failed to rename {} to {}", dest.src_dir, dest.new_dir))?;
        }
        info!(snapshot = %dest.new_dir, "Data directory snapshot taken");
        Ok(())
    }

    async fn seed_docs(&self) -> Result<(), PowercycleError> {
        let task = self.task()?;
        let rpc = self.connector.connect(Endpoint::local(self.port()));
        let count = commands::seed_docs(rpc.as_ref(), DB_NAME, COLLECTION_NAME, task.seed_doc_num)
            .await?;
        info!(count, "Seeded {DB_NAME}.{COLLECTION_NAME}");
        Ok(())
    }

    async fn set_fcv(&self) -> Result<(), PowercycleError> {
        let task = self.task()?;
        let Some(fcv) = task.fcv.as_deref() else {
            info!("No feature compatibility version configured");
            return Ok(());
        };
        let rpc = self.connector.connect(Endpoint::local(self.port()));
        commands::set_feature_compatibility_version(rpc.as_ref(), fcv).await?;
        info!(fcv, "Feature compatibility version set");
        Ok(())
    }

    async fn check_disk(&self) -> Result<(), PowercycleError> {
        let output = run_local(
            "df",
            &[
                "-k".to_string(),
                self.layout.db_path.clone(),
                self.layout.remote_dir.clone(),
            ],
        )
        .await?;
        info!("Disk usage:\n{}", output.trim_end());
        Ok(())
    }
}

/// Run a host command; non-zero exit is a [`RemoteCommandError`].
async fn run_local(program: &str, args: &[String]) -> Result<String, PowercycleError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to run {program}"))?;
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    if output.status.success() {
        Ok(text)
    } else {
        Err(RemoteCommandError {
            command: format!("{program} {}", args.join(" ")),
            exit_code: output.status.code().unwrap_or(-1),
            output: text,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RpcError, ServerRpc, check_reply, command_name};
    use crate::supervisor::ServerState;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[test]
    fn test_boot_time_line_round_trips_through_parser() {
        let boot = Utc.with_ymd_and_hms(2024, 3, 4, 5, 6, 7).unwrap();
        let now = boot + chrono::Duration::seconds(90);
        let line = boot_time_line(boot, now);
        assert_eq!(line, "System was last booted 2024-03-04 05:06:07, up 90 seconds");
        let output = format!("[INFO] {line}\nother noise\n");
        assert_eq!(parse_boot_time(&output), Some(boot.naive_utc()));
        assert_eq!(parse_boot_time("System was last booted garbage, up 1 seconds"), None);
        assert_eq!(parse_boot_time("nothing here"), None);
    }

    #[test]
    fn test_exit_codes_keep_error_kind() {
        assert_eq!(exit_code(&Ok(())), 0);
        let protocol: Result<(), PowercycleError> = Err(ProtocolError::NotPrimary { port: 1 }.into());
        assert_eq!(exit_code(&protocol), PROTOCOL_FAILURE_EXIT_CODE);
        let other: Result<(), PowercycleError> = Err(PowercycleError::Other(anyhow!("x")));
        assert_eq!(exit_code(&other), 1);
    }

    #[test]
    fn test_expansions_missing_file_is_refused() {
        let dir = tempdir().unwrap();
        let err = Expansions::load(&dir.path().join("expansions.yml")).unwrap_err();
        assert!(err.to_string().contains("refusing to run"));
    }

    #[test]
    fn test_expansions_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("expansions.yml");
        std::fs::write(&path, "task_name: powercycle_smoke_3\nretries: 4\n").unwrap();
        let exp = Expansions::load(&path).unwrap();
        assert_eq!(exp.get("task_name").as_deref(), Some("powercycle_smoke_3"));
        assert_eq!(exp.get("retries").as_deref(), Some("4"));
        assert_eq!(exp.get("windows_crash_cmd"), None);

        std::fs::write(&path, "").unwrap();
        assert!(Expansions::load(&path).unwrap().get("task_name").is_none());
    }

    #[test]
    fn test_rsync_paths() {
        assert_eq!(rsync_path(HostFamily::Linux, "/data/db"), "/data/db");
        assert_eq!(rsync_path(HostFamily::Windows, "C:/data/db"), "/cygdrive/c/data/db");
        assert_eq!(
            rsync_path(HostFamily::Windows, r"C:\log\powercycle"),
            "/cygdrive/c/log/powercycle"
        );
    }

    struct RecordingPlatform {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HostPlatform for RecordingPlatform {
        fn family(&self) -> HostFamily {
            HostFamily::Linux
        }
        async fn install(&self, _: &ServerInstance) -> anyhow::Result<()> {
            Ok(())
        }
        async fn start(&self, i: &ServerInstance) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(format!("start {}", i.port));
            Ok(())
        }
        async fn stop(&self, _: &ServerInstance) -> anyhow::Result<()> {
            Ok(())
        }
        async fn status(&self, _: &ServerInstance) -> ServerState {
            ServerState::Stopped
        }
        async fn kill(&self, _: &ServerInstance) -> anyhow::Result<()> {
            self.events.lock().unwrap().push("kill".to_string());
            Ok(())
        }
        async fn crash_internal(&self, _: Option<&str>, _: bool) -> anyhow::Result<String> {
            Ok(String::new())
        }
        fn event_log_collect(&self, _: &str) -> Vec<String> {
            Vec::new()
        }
        fn boot_time(&self) -> anyhow::Result<DateTime<Utc>> {
            Ok(Utc::now())
        }
    }

    struct CountingRpc {
        endpoint: Endpoint,
        inserted: Arc<Mutex<u64>>,
    }

    #[async_trait]
    impl ServerRpc for CountingRpc {
        fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }
        async fn run_command(&self, _db: &str, command: Value) -> Result<Value, RpcError> {
            let mut inserted = self.inserted.lock().unwrap();
            let reply = match command_name(&command).as_str() {
                "count" => json!({"ok": 1, "n": *inserted}),
                "insert" => {
                    let n = command["documents"].as_array().map_or(0, Vec::len) as u64;
                    *inserted += n;
                    json!({"ok": 1, "n": n})
                }
                "isMaster" => json!({"ok": 1, "ismaster": true}),
                _ => json!({"ok": 1}),
            };
            check_reply(&command, reply)
        }
    }

    struct CountingConnector {
        inserted: Arc<Mutex<u64>>,
    }

    impl RpcConnector for CountingConnector {
        fn connect(&self, endpoint: Endpoint) -> Box<dyn ServerRpc> {
            Box::new(CountingRpc {
                endpoint,
                inserted: self.inserted.clone(),
            })
        }
    }

    fn agent(dir: &Path, request: RemoteRequest) -> (Agent, Arc<RecordingPlatform>, Arc<Mutex<u64>>) {
        let remote = dir.join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::write(remote.join("expansions.yml"), "task_name: powercycle_smoke_7\n").unwrap();
        std::fs::write(
            remote.join("powercycle_tasks.yml"),
            "tasks:\n  - name: powercycle_smoke\n    seed_doc_num: 1500\n    fcv: \"7.0\"\n",
        )
        .unwrap();
        let layout = AgentLayout::rooted(
            &remote.display().to_string(),
            &dir.join("db").display().to_string(),
        );
        let expansions = Expansions::load(Path::new(&layout.expansions_file())).unwrap();
        let platform = Arc::new(RecordingPlatform {
            events: Mutex::new(Vec::new()),
        });
        let inserted = Arc::new(Mutex::new(0));
        let agent = Agent::with_parts(
            request,
            layout,
            HostFamily::Linux,
            expansions,
            platform.clone(),
            Arc::new(CountingConnector {
                inserted: inserted.clone(),
            }),
        );
        (agent, platform, inserted)
    }

    #[tokio::test]
    async fn test_seed_docs_uses_task_from_expansions() {
        let dir = tempdir().unwrap();
        let (agent, _, inserted) = agent(dir.path(), RemoteRequest::new(RemoteOperation::SeedDocs));
        agent.run().await.unwrap();
        assert_eq!(*inserted.lock().unwrap(), 1500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verbs_run_in_order() {
        let dir = tempdir().unwrap();
        let request = RemoteRequest::new(RemoteOperation::StartMongod)
            .then(RemoteOperation::SetFcv)
            .then(RemoteOperation::KillMongod)
            .port(37017);
        let (agent, platform, _) = agent(dir.path(), request);
        agent.run().await.unwrap();
        assert_eq!(
            *platform.events.lock().unwrap(),
            vec!["start 37017".to_string(), "kill".to_string()]
        );
        assert!(dir.path().join("db").is_dir());
    }

    #[test]
    fn test_boot_line_survives_quiet_log_level() {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::layer::SubscriberExt;

        let dir = tempdir().unwrap();
        let (agent, _, _) = agent(dir.path(), RemoteRequest::new(RemoteOperation::Noop));
        let quiet = tracing_subscriber::registry()
            .with(EnvFilter::new(crate::logging::level_directive("warning")))
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::sink));

        let mut out = Vec::new();
        tracing::subscriber::with_default(quiet, || agent.announce_boot(&mut out));

        let after = parse_boot_time(&String::from_utf8(out).unwrap());
        assert!(after.is_some());
        let later = after.map(|t| t + chrono::Duration::minutes(1));
        assert!(matches!(
            crate::controller::check_boot_time(later, after),
            Err(ProtocolError::BootTimeNotNewer { .. })
        ));
    }

    #[tokio::test]
    async fn test_rsync_without_destination_fails() {
        let dir = tempdir().unwrap();
        let (agent, _, _) = agent(dir.path(), RemoteRequest::new(RemoteOperation::RsyncData));
        let err = agent.run().await.unwrap_err();
        assert!(err.to_string().contains("--rsyncDest"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_that_returns_is_a_protocol_failure() {
        let dir = tempdir().unwrap();
        let (agent, _, _) = agent(dir.path(), RemoteRequest::new(RemoteOperation::CrashServer));
        let result = agent.run().await;
        assert!(matches!(
            result,
            Err(PowercycleError::Protocol(ProtocolError::CrashNotDelivered { .. }))
        ));
        assert_eq!(exit_code(&result), PROTOCOL_FAILURE_EXIT_CODE);
    }
}
