//! Iteration controller: sequences the phases of every powercycle
//! iteration and owns the driver's view of the run.

mod phase;

pub use phase::{IterationState, Phase};

use crate::agent::{self, AgentClient, AgentDefaults};
use crate::artifacts::ArtifactCollector;
use crate::canary::{self, CanaryDocument};
use crate::context::RunContext;
use crate::crash::{CrashInjector, CrashOutcome, CrashSchedule};
use crate::errors::{PowercycleError, ProtocolError, TransportError};
use crate::rpc::{Endpoint, RpcConnector, ServerRpc, commands};
use crate::transport::{RemoteShell, shell_checked};
use crate::wait::WaitPolicy;
use crate::workload::{WorkloadFleet, WorkloadSettings};
use chrono::NaiveDateTime;
use powercycle_common::layout::{COLLECTION_NAME, DB_NAME};
use powercycle_common::{
    AgentLayout, CrashMethod, HostFamily, RemoteOperation, RemoteRequest, SECRET_PORT,
    STANDARD_PORT, TaskConfig,
};
use std::cell::Cell;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub family: HostFamily,
    /// Host the server is reached at, from the driver and as its own
    /// replica-set member name.
    pub mongod_host: String,
    pub agent: AgentDefaults,
    pub workload: WorkloadSettings,
    pub artifact_dir: PathBuf,
    pub rsync: bool,
    pub schedule: CrashSchedule,
    /// Pause after a host crash before probing it again.
    pub crash_settle: Duration,
    /// Standard-port primary wait before the workload starts.
    pub primary_wait: WaitPolicy,
    /// When set, iterations repeat until this much time has passed instead
    /// of running the task's loop count.
    pub test_time: Option<Duration>,
}

impl ControllerSettings {
    pub fn new(family: HostFamily, mongod_host: impl Into<String>, workload: WorkloadSettings) -> Self {
        Self {
            family,
            mongod_host: mongod_host.into(),
            agent: AgentDefaults::default(),
            artifact_dir: PathBuf::from("."),
            workload,
            rsync: false,
            schedule: CrashSchedule::default(),
            crash_settle: family.crash_settle_time(),
            primary_wait: WaitPolicy::secs(60, 3),
            test_time: None,
        }
    }
}

#[derive(Debug, Error)]
#[error("Iteration {iteration} failed in phase {phase}: {error}")]
pub struct RunFailure {
    pub iteration: u32,
    pub phase: Phase,
    #[source]
    pub error: PowercycleError,
}

impl RunFailure {
    /// First line of the transport output when the channel itself failed.
    pub fn ssh_failure(&self) -> Option<String> {
        match &self.error {
            PowercycleError::Transport(err) => Some(err.first_line()),
            _ => None,
        }
    }
}

/// Boot time must strictly advance across a host crash. Unparseable boot
/// times skip the check.
pub fn check_boot_time(
    before: Option<NaiveDateTime>,
    after: Option<NaiveDateTime>,
) -> Result<(), ProtocolError> {
    match (before, after) {
        (Some(before), Some(after)) if after > before => {
            info!(%before, %after, "Host rebooted");
            Ok(())
        }
        (Some(before), Some(after)) => Err(ProtocolError::BootTimeNotNewer {
            before: before.to_string(),
            after: after.to_string(),
        }),
        _ => {
            warn!(?before, ?after, "Boot time unavailable, skipping reboot check");
            Ok(())
        }
    }
}

pub struct IterationController {
    shell: Box<dyn RemoteShell>,
    connector: Arc<dyn RpcConnector>,
    agent: AgentClient,
    fleet: WorkloadFleet,
    collector: ArtifactCollector,
    task: TaskConfig,
    layout: AgentLayout,
    settings: ControllerSettings,
}

impl IterationController {
    /// Loop and client counts of `task` are capped for the host family.
    pub fn new(
        shell: Box<dyn RemoteShell>,
        connector: Arc<dyn RpcConnector>,
        task: TaskConfig,
        settings: ControllerSettings,
    ) -> Self {
        let family = settings.family;
        let layout = family.layout();
        let mut defaults = settings.agent.clone();
        defaults.task_name.get_or_insert_with(|| task.name.clone());
        Self {
            agent: AgentClient::new(&layout, family, defaults),
            fleet: WorkloadFleet::new(settings.workload.clone()),
            collector: ArtifactCollector::new(layout.clone(), family, settings.artifact_dir.clone()),
            task: task.capped(family.caps()),
            shell,
            connector,
            layout,
            settings,
        }
    }

    pub fn task(&self) -> &TaskConfig {
        &self.task
    }

    pub fn shell(&self) -> &dyn RemoteShell {
        self.shell.as_ref()
    }

    /// Upload `payload` into the remote directory and install the server.
    pub async fn prepare(
        &self,
        payload: &[PathBuf],
        download_url: Option<&str>,
    ) -> Result<(), PowercycleError> {
        let remote_dir = self.agent.remote_dir();
        shell_checked(self.shell(), &format!("mkdir -p {remote_dir}"), None).await?;
        let copied = self.shell.copy_to(payload, Some(remote_dir)).await?;
        if !copied.success() {
            return Err(anyhow::anyhow!("Upload to {remote_dir} failed: {}", copied.output.trim()).into());
        }
        info!(files = payload.len(), remote_dir, "Payload uploaded");

        let mut request = RemoteRequest::new(RemoteOperation::InstallMongod);
        request.download_url = download_url.map(str::to_string);
        self.agent.run(self.shell(), request).await?;
        Ok(())
    }

    /// Prepare the host, then run every iteration. A transport failure is
    /// recorded on `ctx`. Returns the exit code.
    pub async fn execute(
        &self,
        ctx: &mut RunContext,
        payload: &[PathBuf],
        download_url: Option<&str>,
    ) -> i32 {
        if let Err(err) = self.prepare(payload, download_url).await {
            error!(kind = err.kind(), error = %err, "Host preparation failed");
            if let PowercycleError::Transport(transport) = &err {
                ctx.record_ssh_failure(transport.first_line());
            }
            return 1;
        }
        match self.run(ctx).await {
            Ok(iterations) => {
                info!(iterations, "Every iteration passed");
                0
            }
            Err(failure) => {
                if let Some(message) = failure.ssh_failure() {
                    ctx.record_ssh_failure(message);
                }
                1
            }
        }
    }

    /// Run every iteration. Returns how many ran.
    pub async fn run(&self, ctx: &mut RunContext) -> Result<u32, RunFailure> {
        let test_time = self.settings.test_time;
        let loops = match test_time {
            Some(_) => u32::MAX,
            None => self.task.test_loops,
        };
        info!(
            task = %self.task.name,
            loops,
            test_time_secs = test_time.map(|t| t.as_secs()),
            crash_method = %self.task.crash_method,
            "Starting powercycle"
        );
        let run_started = tokio::time::Instant::now();
        let mut canary = None;
        for iteration in 1..=loops {
            let mut state = IterationState::new(iteration, canary.take());
            let result = self.iterate(ctx, &mut state).await;
            WorkloadFleet::drain(ctx).await;
            if let Err(error) = result {
                let failure = RunFailure {
                    iteration,
                    phase: state.phase,
                    error,
                };
                error!(iteration, phase = %failure.phase, kind = failure.error.kind(), error = %failure.error, "Iteration failed");
                self.collect_after_failure(iteration, &failure.error).await;
                return Err(failure);
            }
            info!(
                iteration,
                elapsed_secs = state.started.elapsed().as_secs(),
                "Iteration complete"
            );
            self.collector.collect(self.shell(), iteration, false).await;
            canary = state.canary;
            if let Some(limit) = test_time {
                let elapsed = run_started.elapsed();
                if elapsed >= limit {
                    info!(iteration, elapsed_secs = elapsed.as_secs(), "Test time reached");
                    return Ok(iteration);
                }
            }
        }
        Ok(loops)
    }

    async fn iterate(
        &self,
        ctx: &mut RunContext,
        state: &mut IterationState,
    ) -> Result<(), PowercycleError> {
        let n = state.iteration;
        let host = self.settings.mongod_host.as_str();
        self.check_disk().await;

        if self.settings.rsync {
            state.enter(Phase::PreRsync);
            self.snapshot(self.layout.backup_before(n - 1), self.layout.backup_before(n))
                .await?;
        }

        state.enter(Phase::RecoveryStart);
        let mut request = RemoteRequest::new(RemoteOperation::StartMongod)
            .port(SECRET_PORT)
            .host(host);
        if n == 1 {
            request = request
                .then(RemoteOperation::SeedDocs)
                .then(RemoteOperation::SetFcv);
        }
        self.agent.run(self.shell(), request).await?;
        let secret = self.connector.connect(Endpoint::new(host, SECRET_PORT));

        state.enter(Phase::Validate);
        canary::validate(
            secret.as_ref(),
            DB_NAME,
            COLLECTION_NAME,
            state.canary.as_ref(),
            !self.task.guarantees_durability(),
        )
        .await?;
        self.validate_collections(secret.as_ref(), n).await?;

        state.enter(Phase::ShutdownSecret);
        self.agent
            .run(
                self.shell(),
                RemoteRequest::new(RemoteOperation::ShutdownMongod).port(SECRET_PORT),
            )
            .await?;

        if self.settings.rsync {
            state.enter(Phase::PostRsync);
            self.snapshot(self.layout.backup_after(n - 1), self.layout.backup_after(n))
                .await?;
        }

        state.enter(Phase::StandardStart);
        let started = self
            .agent
            .run(
                self.shell(),
                RemoteRequest::new(RemoteOperation::StartMongod)
                    .port(STANDARD_PORT)
                    .host(host),
            )
            .await?;
        state.boot_time = agent::parse_boot_time(&started.output);

        state.enter(Phase::Workload);
        let endpoint = Endpoint::new(host, STANDARD_PORT);
        let standard = self.connector.connect(endpoint.clone());
        commands::wait_for_primary(standard.as_ref(), self.settings.primary_wait).await?;
        self.fleet.start(ctx, &self.task, &endpoint)?;

        state.enter(Phase::CanaryInsert);
        let inserted: Cell<Option<CanaryDocument>> = Cell::new(None);
        let injector = CrashInjector::new(
            self.shell(),
            &self.agent,
            self.task.crash_method,
            self.settings.schedule,
            self.settings.crash_settle,
        );
        let outcome = injector
            .crash(async {
                let doc = CanaryDocument::now();
                canary::insert(standard.as_ref(), DB_NAME, COLLECTION_NAME, &doc).await?;
                inserted.set(Some(doc));
                Ok::<(), PowercycleError>(())
            })
            .await;
        if inserted.get().is_some() {
            state.canary = inserted.get();
            state.enter(Phase::Crash);
        }
        let outcome = outcome?;

        state.enter(Phase::PostCrashVerify);
        WorkloadFleet::drain(ctx).await;
        self.shell.probe().await?;
        let after = self
            .agent
            .run(self.shell(), RemoteRequest::new(RemoteOperation::Noop))
            .await?;
        if outcome == CrashOutcome::HostCrashed {
            check_boot_time(state.boot_time, agent::parse_boot_time(&after.output))?;
        } else if self.task.crash_method == CrashMethod::Kill {
            info!("Server killed, host boot time unchanged");
        }
        Ok(())
    }

    async fn snapshot(&self, src_dir: String, new_dir: String) -> Result<(), PowercycleError> {
        self.agent
            .run(
                self.shell(),
                RemoteRequest::new(RemoteOperation::RsyncData).rsync(src_dir, new_dir),
            )
            .await
            .map(|_| ())
    }

    /// Network errors from the first validation mean the driver cannot
    /// reach the host at all.
    async fn validate_collections(
        &self,
        rpc: &dyn ServerRpc,
        iteration: u32,
    ) -> Result<(), PowercycleError> {
        match commands::validate_collections(rpc).await {
            Ok(report) if report.invalid.is_empty() => {
                info!(
                    validated = report.validated.len(),
                    permitted = report.permitted.len(),
                    "Collections validated"
                );
                Ok(())
            }
            Ok(report) => Err(ProtocolError::InvalidCollections(report.invalid).into()),
            Err(err) if iteration == 1 && err.is_network_error() => Err(TransportError::AccessFailed {
                user_host: self.shell.user_host().to_string(),
                attempts: 1,
                output: err.to_string(),
            }
            .into()),
            Err(err) => Err(err.into()),
        }
    }

    async fn check_disk(&self) {
        if let Err(err) = self
            .agent
            .run(self.shell(), RemoteRequest::new(RemoteOperation::CheckDisk))
            .await
        {
            warn!(error = %err, "Disk check failed");
        }
    }

    /// Kill the server and gather artifacts for a failed iteration. After a
    /// transport failure the host must answer a fresh access check first.
    async fn collect_after_failure(&self, iteration: u32, error: &PowercycleError) {
        if error.is_transport() {
            if let Err(err) = self.shell.probe().await {
                warn!(error = %err, "Host unreachable; skipping artifact collection");
                return;
            }
            info!("Host reachable again after transport failure");
        }
        self.kill_server().await;
        self.collector.collect(self.shell(), iteration, true).await;
    }

    async fn kill_server(&self) {
        match self
            .agent
            .run(self.shell(), RemoteRequest::new(RemoteOperation::KillMongod))
            .await
        {
            Ok(_) => info!("Server killed before artifact collection"),
            Err(err) => warn!(error = %err, "Could not kill server"),
        }
    }
}
