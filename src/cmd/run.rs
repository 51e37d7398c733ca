//! Driver mode: probe the host, upload the agent, run the iterations.

use anyhow::{Context, Result};
use powercycle::cli::Cli;
use powercycle::context::RunContext;
use powercycle::controller::{ControllerSettings, IterationController};
use powercycle::diagnostics;
use powercycle::report::ReportWriter;
use powercycle::rpc::MongoShellConnector;
use powercycle::transport::{RemoteShell, SshTransport};
use powercycle::workload::WorkloadSettings;
use powercycle_common::layout::{EXPANSIONS_FILE, TASKS_FILE};
use powercycle_common::{HostFamily, TaskConfig, TaskProfiles};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{error, info, warn};

const DEFAULT_TASK: &str = "powercycle";

/// Returns the process exit code. Reports are written on every path.
pub async fn run_driver(cli: &Cli) -> i32 {
    let test_file = cli.task_name.as_deref().unwrap_or(DEFAULT_TASK);
    let writer = match ReportWriter::new(&cli.report_json_file, &cli.exit_yaml_file, test_file) {
        Ok(writer) => writer,
        Err(err) => {
            error!("{err:#}");
            return 1;
        }
    };
    let mut ctx = RunContext::new(writer);

    let outcome = tokio::select! {
        code = drive(cli, &mut ctx) => Some(code),
        _ = diagnostics::triggered() => None,
    };
    let code = match outcome {
        Some(code) => code,
        None => {
            diagnostics::dump(&ctx);
            1
        }
    };
    ctx.finish(code).await
}

async fn drive(cli: &Cli, ctx: &mut RunContext) -> i32 {
    let Some(user_host) = cli.ssh_user_host.as_deref() else {
        error!("--sshUserHost is required");
        return 1;
    };
    let options = match cli.ssh_options() {
        Ok(options) => options,
        Err(err) => {
            error!("{err:#}");
            return 1;
        }
    };
    let shell = SshTransport::new(user_host, options);

    if let Err(err) = shell.probe().await {
        error!(error = %err, "Host unreachable");
        ctx.record_ssh_failure(err.first_line());
        return 1;
    }
    let task = match resolve_task(cli) {
        Ok(task) => task,
        Err(err) => {
            error!("{err:#}");
            return 1;
        }
    };
    let family = match shell.shell("uname", None).await {
        Ok(output) => HostFamily::from_uname(&output.output),
        Err(err) => {
            error!(error = %err, "Could not identify host platform");
            ctx.record_ssh_failure(err.first_line());
            return 1;
        }
    };
    info!(user_host, %family, task = %task.name, "Host reachable");

    let staging = match stage_payload(cli, family) {
        Ok(staging) => staging,
        Err(err) => {
            error!("{err:#}");
            return 1;
        }
    };

    let mongod_host = user_host.rsplit('@').next().unwrap_or(user_host);
    let mut settings = ControllerSettings::new(
        family,
        mongod_host,
        WorkloadSettings {
            python: cli.python.clone(),
            mongo_repo_root_dir: cli.mongo_repo_root_dir.clone(),
            mongo_path: cli.mongo_path.clone(),
            log_dir: cli.artifact_dir.clone(),
        },
    );
    settings.agent = cli.agent_defaults();
    settings.artifact_dir = cli.artifact_dir.clone();
    settings.rsync = cli.rsync;
    settings.schedule = cli.crash_schedule();
    settings.test_time = cli.test_time();

    let connector = Arc::new(MongoShellConnector::new(&cli.mongo_path));
    let controller = IterationController::new(Box::new(shell), connector, task, settings);
    controller
        .execute(ctx, &staging.files, cli.download_url.as_deref())
        .await
}

fn resolve_task(cli: &Cli) -> Result<TaskConfig> {
    let profiles = TaskProfiles::load(&cli.config_file)?;
    let task = profiles.resolve(cli.task_name.as_deref().unwrap_or(DEFAULT_TASK))?;
    task.validate()?;
    Ok(task)
}

/// Files uploaded to the agent's remote directory, under the names the
/// agent looks for.
struct Payload {
    _dir: TempDir,
    files: Vec<PathBuf>,
}

fn stage_payload(cli: &Cli, family: HostFamily) -> Result<Payload> {
    let dir = tempfile::Builder::new()
        .prefix("powercycle-payload-")
        .tempdir()
        .context("Failed to create payload directory")?;
    let agent_binary = match &cli.remote_binary {
        Some(path) => path.clone(),
        None => std::env::current_exe().context("Cannot locate the running executable")?,
    };

    let mut files = vec![stage(dir.path(), &agent_binary, &family.agent_binary())?];
    files.push(stage(dir.path(), &cli.config_file, TASKS_FILE)?);
    if cli.expansions_file.exists() {
        files.push(stage(dir.path(), &cli.expansions_file, EXPANSIONS_FILE)?);
    } else {
        warn!(
            path = %cli.expansions_file.display(),
            "Expansions file missing, the agent will refuse to run"
        );
    }
    Ok(Payload { _dir: dir, files })
}

fn stage(dir: &Path, source: &Path, name: &str) -> Result<PathBuf> {
    let target = dir.join(name);
    std::fs::copy(source, &target)
        .with_context(|| format!("Failed to stage {}", source.display()))?;
    Ok(target)
}
