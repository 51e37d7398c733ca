//! Process supervisor for the database server on the agent host.
//!
//! Host-specific behaviour lives behind [`HostPlatform`], with one
//! implementation per host family: [`PosixPlatform`] forks the server and
//! tracks it through the process table, [`WindowsPlatform`] drives it as a
//! service. [`Supervisor`] layers the shared protocol on top: liveness and
//! replica-set bring-up after start, polling for the stopped state after
//! stop, kill and shutdown.

pub mod install;
mod posix;
mod windows;

pub use posix::PosixPlatform;
pub use windows::WindowsPlatform;

use crate::errors::{PowercycleError, ProtocolError};
use crate::rpc::commands::{self, ReplSetAction};
use crate::rpc::{Endpoint, RpcConnector, ServerRpc};
use crate::wait::{WaitPolicy, wait_until};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use powercycle_common::{AgentLayout, HostFamily, MongodOptions, OptionForm, TaskConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Name the server is registered under with the Windows service manager.
pub const SERVICE_NAME: &str = "mongod-powertest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    Stopped,
    StartPending,
    StopPending,
    Paused,
    PausePending,
    ContinuePending,
    NotInstalled,
    Unknown,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerState::Running => "running",
            ServerState::Stopped => "stopped",
            ServerState::StartPending => "start pending",
            ServerState::StopPending => "stop pending",
            ServerState::Paused => "paused",
            ServerState::PausePending => "pause pending",
            ServerState::ContinuePending => "continue pending",
            ServerState::NotInstalled => "not installed",
            ServerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One server configuration: where it lives and how it is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInstance {
    pub bin_dir: PathBuf,
    pub binary_name: String,
    pub db_path: PathBuf,
    pub log_path: PathBuf,
    pub port: u16,
    pub options: MongodOptions,
}

impl ServerInstance {
    /// Build the server command line for `port`: the task's own options
    /// plus the paths, port and daemon flags the supervisor controls.
    pub fn new(
        family: HostFamily,
        layout: &AgentLayout,
        task: &TaskConfig,
        port: u16,
    ) -> Result<Self, PowercycleError> {
        let mut options = task
            .server_options()
            .map_err(|err| PowercycleError::Other(err.into()))?;
        options.dbpath = Some(layout.db_path.clone());
        options.logpath = Some(layout.log_path.clone());
        options.logappend = true;
        options.port = Some(port);
        options.bind_ip = Some("0.0.0.0".to_string());
        if let Some(repl_set) = &task.repl_set {
            options.repl_set = Some(repl_set.clone());
        }
        match family {
            HostFamily::Linux => options.fork = true,
            HostFamily::Windows => {
                if !options.has("service") {
                    options.push_extra("service", OptionForm::Long, None);
                }
            }
        }
        Ok(Self {
            bin_dir: PathBuf::from(layout.bin_dir()),
            binary_name: family.server_binary(),
            db_path: PathBuf::from(&layout.db_path),
            log_path: PathBuf::from(&layout.log_path),
            port,
            options,
        })
    }

    pub fn binary(&self) -> PathBuf {
        self.bin_dir.join(&self.binary_name)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.db_path.join("mongod.lock")
    }
}

/// Host-family capabilities. Selected once per process.
#[async_trait]
pub trait HostPlatform: Send + Sync {
    fn family(&self) -> HostFamily;

    /// Host-side registration after the binaries are unpacked.
    async fn install(&self, instance: &ServerInstance) -> Result<()>;

    /// Launch the server; returns once the launch command completed.
    async fn start(&self, instance: &ServerInstance) -> Result<()>;

    /// Ask the server to stop gracefully without waiting.
    async fn stop(&self, instance: &ServerInstance) -> Result<()>;

    async fn status(&self, instance: &ServerInstance) -> ServerState;

    /// Hard-kill every server process by name.
    async fn kill(&self, instance: &ServerInstance) -> Result<()>;

    /// Issue the host-level crash. Returns the command output; a host that
    /// actually crashes never returns.
    async fn crash_internal(&self, crash_option: Option<&str>, sudo: bool) -> Result<String>;

    fn core_suffix(&self) -> &'static str {
        self.family().core_suffix()
    }

    /// Shell commands exporting the host event logs into `dest_dir`.
    fn event_log_collect(&self, dest_dir: &str) -> Vec<String>;

    fn boot_time(&self) -> Result<DateTime<Utc>>;
}

pub fn platform_for(family: HostFamily) -> Box<dyn HostPlatform> {
    match family {
        HostFamily::Linux => Box::new(PosixPlatform::new()),
        HostFamily::Windows => Box::new(WindowsPlatform::new()),
    }
}

/// Wait budgets of the supervisor.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorWaits {
    pub liveness: WaitPolicy,
    pub primary: WaitPolicy,
    pub stop: WaitPolicy,
    pub kill: WaitPolicy,
    /// Pause after reaching stopped so late file flushes land first.
    pub stop_settle: Duration,
}

impl Default for SupervisorWaits {
    fn default() -> Self {
        Self {
            liveness: WaitPolicy::secs(60, 3),
            primary: WaitPolicy::secs(60, 3),
            stop: WaitPolicy::secs(120, 3),
            kill: WaitPolicy::secs(120, 3),
            stop_settle: Duration::from_secs(5),
        }
    }
}

pub struct Supervisor {
    platform: Arc<dyn HostPlatform>,
    instance: ServerInstance,
    connector: Arc<dyn RpcConnector>,
    waits: SupervisorWaits,
}

impl Supervisor {
    pub fn new(
        platform: Arc<dyn HostPlatform>,
        instance: ServerInstance,
        connector: Arc<dyn RpcConnector>,
    ) -> Self {
        Self {
            platform,
            instance,
            connector,
            waits: SupervisorWaits::default(),
        }
    }

    pub fn with_waits(mut self, waits: SupervisorWaits) -> Self {
        self.waits = waits;
        self
    }

    pub fn instance(&self) -> &ServerInstance {
        &self.instance
    }

    fn rpc(&self) -> Box<dyn ServerRpc> {
        self.connector.connect(Endpoint::local(self.instance.port))
    }

    pub async fn status(&self) -> ServerState {
        self.platform.status(&self.instance).await
    }

    /// Launch the server and wait until it answers. With a replica set
    /// configured, also initiate or reconfigure it and wait for primary.
    /// `host_port` is the member address clients will use.
    pub async fn start(
        &self,
        repl_set: Option<&str>,
        host_port: &str,
    ) -> Result<Option<ReplSetAction>, PowercycleError> {
        info!(
            port = self.instance.port,
            options = %self.instance.options.to_command_line(),
            "Starting server"
        );
        self.platform.start(&self.instance).await?;

        let rpc = self.rpc();
        commands::wait_for_liveness(rpc.as_ref(), self.waits.liveness).await?;
        commands::log_server_info(rpc.as_ref()).await;

        match repl_set {
            Some(repl_set) => {
                let action =
                    commands::ensure_replica_set(rpc.as_ref(), repl_set, host_port, self.waits.primary)
                        .await?;
                info!(repl_set, ?action, "Replica set ready");
                Ok(Some(action))
            }
            None => Ok(None),
        }
    }

    async fn wait_for_stopped(&self, policy: WaitPolicy) -> Result<(), ProtocolError> {
        let result = wait_until(policy, || async {
            Ok::<_, std::convert::Infallible>(self.status().await == ServerState::Stopped)
        })
        .await;
        match result {
            Ok(_) => {
                tokio::time::sleep(self.waits.stop_settle).await;
                Ok(())
            }
            Err(timeout) => {
                let state = self.status().await;
                warn!(%state, %timeout, "Server did not stop");
                Err(ProtocolError::StopTimedOut {
                    timeout_secs: policy.timeout.as_secs(),
                    state: state.to_string(),
                })
            }
        }
    }

    /// Graceful stop, then wait for the stopped state.
    pub async fn stop(&self) -> Result<(), PowercycleError> {
        info!(port = self.instance.port, "Stopping server");
        self.platform.stop(&self.instance).await?;
        self.wait_for_stopped(self.waits.stop).await?;
        Ok(())
    }

    /// Shutdown through the server's own RPC, then wait for the stopped
    /// state.
    pub async fn shutdown(&self) -> Result<(), PowercycleError> {
        info!(port = self.instance.port, "Shutting down server");
        commands::shutdown(self.rpc().as_ref()).await?;
        self.wait_for_stopped(self.waits.stop).await?;
        Ok(())
    }

    pub async fn kill(&self) -> Result<(), PowercycleError> {
        info!("Killing server");
        self.platform.kill(&self.instance).await?;
        self.wait_for_stopped(self.waits.kill).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RpcError, check_reply, command_name};
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Platform whose status flips to stopped after a number of polls.
    struct FakePlatform {
        polls_until_stopped: usize,
        polls: AtomicUsize,
        events: Mutex<Vec<&'static str>>,
    }

    impl FakePlatform {
        fn new(polls_until_stopped: usize) -> Self {
            Self {
                polls_until_stopped,
                polls: AtomicUsize::new(0),
                events: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HostPlatform for FakePlatform {
        fn family(&self) -> HostFamily {
            HostFamily::Linux
        }
        async fn install(&self, _: &ServerInstance) -> Result<()> {
            Ok(())
        }
        async fn start(&self, _: &ServerInstance) -> Result<()> {
            self.events.lock().unwrap().push("start");
            Ok(())
        }
        async fn stop(&self, _: &ServerInstance) -> Result<()> {
            self.events.lock().unwrap().push("stop");
            Ok(())
        }
        async fn status(&self, _: &ServerInstance) -> ServerState {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.polls_until_stopped {
                ServerState::Stopped
            } else {
                ServerState::StopPending
            }
        }
        async fn kill(&self, _: &ServerInstance) -> Result<()> {
            self.events.lock().unwrap().push("kill");
            Ok(())
        }
        async fn crash_internal(&self, _: Option<&str>, _: bool) -> Result<String> {
            Ok(String::new())
        }
        fn event_log_collect(&self, _: &str) -> Vec<String> {
            Vec::new()
        }
        fn boot_time(&self) -> Result<DateTime<Utc>> {
            Ok(Utc::now())
        }
    }

    struct FixedRpc {
        endpoint: Endpoint,
        ismaster: bool,
    }

    #[async_trait]
    impl ServerRpc for FixedRpc {
        fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }
        async fn run_command(&self, _db: &str, command: Value) -> Result<Value, RpcError> {
            let reply = match command_name(&command).as_str() {
                "isMaster" => json!({"ok": 1, "ismaster": self.ismaster}),
                "shutdown" => json!({"ok": 0, "errmsg": "network error while attempting to run command"}),
                _ => json!({"ok": 1}),
            };
            check_reply(&command, reply)
        }
    }

    struct FixedConnector {
        ismaster: bool,
    }

    impl RpcConnector for FixedConnector {
        fn connect(&self, endpoint: Endpoint) -> Box<dyn ServerRpc> {
            Box::new(FixedRpc {
                endpoint,
                ismaster: self.ismaster,
            })
        }
    }

    fn quick_waits() -> SupervisorWaits {
        let quick = WaitPolicy::new(Duration::from_millis(100), Duration::from_millis(5));
        SupervisorWaits {
            liveness: quick,
            primary: quick,
            stop: quick,
            kill: quick,
            stop_settle: Duration::ZERO,
        }
    }

    fn instance() -> ServerInstance {
        let mut task = TaskConfig::named("powercycle");
        task.mongod_options = "--setParameter enableTestCommands=1".to_string();
        ServerInstance::new(HostFamily::Linux, &HostFamily::Linux.layout(), &task, 37017).unwrap()
    }

    fn supervisor(platform: Arc<FakePlatform>, ismaster: bool) -> Supervisor {
        Supervisor::new(platform, instance(), Arc::new(FixedConnector { ismaster }))
            .with_waits(quick_waits())
    }

    #[test]
    fn test_instance_options_are_canonical() {
        let instance = instance();
        assert_eq!(
            instance.options.to_args(),
            vec![
                "--dbpath",
                "/data/db",
                "--logpath",
                "/log/powercycle/log/mongod.log",
                "--logappend",
                "--port",
                "37017",
                "--bind_ip",
                "0.0.0.0",
                "--fork",
                "--setParameter",
                "enableTestCommands=1",
            ]
        );
        assert_eq!(instance.lock_file(), PathBuf::from("/data/db/mongod.lock"));
    }

    #[test]
    fn test_windows_instance_runs_as_service() {
        let task = TaskConfig::named("powercycle");
        let instance =
            ServerInstance::new(HostFamily::Windows, &HostFamily::Windows.layout(), &task, 27017)
                .unwrap();
        assert!(!instance.options.fork);
        assert!(instance.options.has("service"));
        assert_eq!(instance.binary_name, "mongod.exe");
    }

    #[tokio::test]
    async fn test_stop_polls_until_stopped() {
        let platform = Arc::new(FakePlatform::new(3));
        let sup = supervisor(platform.clone(), true);
        sup.stop().await.unwrap();
        assert_eq!(*platform.events.lock().unwrap(), vec!["stop"]);
        assert!(platform.polls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_stop_times_out() {
        let platform = Arc::new(FakePlatform::new(usize::MAX));
        let sup = supervisor(platform, true);
        let err = sup.stop().await.unwrap_err();
        assert!(matches!(
            err,
            PowercycleError::Protocol(ProtocolError::StopTimedOut { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_standalone_waits_for_liveness_only() {
        let platform = Arc::new(FakePlatform::new(1));
        let sup = supervisor(platform.clone(), false);
        let action = sup.start(None, "db1:37017").await.unwrap();
        assert_eq!(action, None);
        assert_eq!(*platform.events.lock().unwrap(), vec!["start"]);
    }

    #[tokio::test]
    async fn test_shutdown_then_stopped() {
        let platform = Arc::new(FakePlatform::new(1));
        let sup = supervisor(platform, true);
        sup.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_waits_for_stopped() {
        let platform = Arc::new(FakePlatform::new(2));
        let sup = supervisor(platform.clone(), true);
        sup.kill().await.unwrap();
        assert_eq!(*platform.events.lock().unwrap(), vec!["kill"]);
    }
}
