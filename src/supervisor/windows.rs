//! Windows host: the server runs as a service driven through `sc.exe`.

use super::{HostPlatform, SERVICE_NAME, ServerInstance, ServerState};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use powercycle_common::HostFamily;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// `sc` error for a service that does not exist.
const SERVICE_DOES_NOT_EXIST: &str = "1060";

#[derive(Debug, Default)]
pub struct WindowsPlatform;

impl WindowsPlatform {
    pub fn new() -> Self {
        Self
    }
}

fn text(output: &Output) -> String {
    format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

async fn run(program: &str, args: &[String]) -> Result<Output> {
    debug!(program, ?args, "Running host command");
    Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to run {program}"))
}

async fn run_checked(program: &str, args: &[String]) -> Result<String> {
    let output = run(program, args).await?;
    let out = text(&output);
    if !output.status.success() {
        bail!("{program} {} failed: {}", args.join(" "), out.trim());
    }
    Ok(out)
}

/// `binPath=` value registered with the service manager.
fn service_bin_path(instance: &ServerInstance) -> String {
    let binary = instance.binary().display().to_string().replace('/', "\\");
    format!("\"{binary}\" {}", instance.options.to_args().join(" "))
}

/// Map `sc query` output to a state.
pub fn parse_sc_state(output: &str) -> ServerState {
    if output.contains(SERVICE_DOES_NOT_EXIST) {
        return ServerState::NotInstalled;
    }
    let Some(line) = output.lines().find(|l| l.trim_start().starts_with("STATE")) else {
        return ServerState::Unknown;
    };
    let state = line.split_whitespace().last().unwrap_or_default();
    match state {
        "RUNNING" => ServerState::Running,
        "STOPPED" => ServerState::Stopped,
        "START_PENDING" => ServerState::StartPending,
        "STOP_PENDING" => ServerState::StopPending,
        "PAUSED" => ServerState::Paused,
        "PAUSE_PENDING" => ServerState::PausePending,
        "CONTINUE_PENDING" => ServerState::ContinuePending,
        _ => ServerState::Unknown,
    }
}

/// Parse `wmic os get lastbootuptime` output (`20240102030405.500000+000`).
pub fn parse_wmic_boot_time(output: &str) -> Option<DateTime<Utc>> {
    let stamp = output
        .lines()
        .map(str::trim)
        .find(|l| l.len() >= 14 && l.as_bytes()[..14].iter().all(u8::is_ascii_digit))?;
    NaiveDateTime::parse_from_str(&stamp[..14], "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

#[async_trait]
impl HostPlatform for WindowsPlatform {
    fn family(&self) -> HostFamily {
        HostFamily::Windows
    }

    async fn install(&self, instance: &ServerInstance) -> Result<()> {
        // A crash must not leave the host waiting in the boot recovery menu.
        match run(
            "bcdedit",
            &args(&["/set", "{default}", "bootstatuspolicy", "ignoreallfailures"]),
        )
        .await
        {
            Ok(output) if output.status.success() => {}
            Ok(output) => warn!(output = %text(&output).trim(), "bcdedit failed"),
            Err(err) => warn!(error = %err, "bcdedit unavailable"),
        }

        if self.status(instance).await != ServerState::NotInstalled {
            info!(service = SERVICE_NAME, "Service already registered");
            return Ok(());
        }
        run_checked(
            "sc",
            &[
                "create".to_string(),
                SERVICE_NAME.to_string(),
                "binPath=".to_string(),
                service_bin_path(instance),
                "start=".to_string(),
                "demand".to_string(),
            ],
        )
        .await?;
        info!(service = SERVICE_NAME, "Service registered");
        Ok(())
    }

    async fn start(&self, instance: &ServerInstance) -> Result<()> {
        // Options change between the secret and standard ports.
        run_checked(
            "sc",
            &[
                "config".to_string(),
                SERVICE_NAME.to_string(),
                "binPath=".to_string(),
                service_bin_path(instance),
            ],
        )
        .await?;
        run_checked("sc", &args(&["start", SERVICE_NAME])).await?;
        Ok(())
    }

    async fn stop(&self, _instance: &ServerInstance) -> Result<()> {
        run_checked("sc", &args(&["stop", SERVICE_NAME])).await?;
        Ok(())
    }

    async fn status(&self, _instance: &ServerInstance) -> ServerState {
        match run("sc", &args(&["query", SERVICE_NAME])).await {
            Ok(output) => parse_sc_state(&text(&output)),
            Err(err) => {
                warn!(error = %err, "Could not query service");
                ServerState::Unknown
            }
        }
    }

    async fn kill(&self, instance: &ServerInstance) -> Result<()> {
        let output = run("taskkill", &args(&["/F", "/IM", &instance.binary_name])).await?;
        debug!(output = %text(&output).trim(), "taskkill");
        Ok(())
    }

    async fn crash_internal(&self, crash_option: Option<&str>, _sudo: bool) -> Result<String> {
        let Some(command) = crash_option else {
            bail!("No crash command configured for Windows hosts");
        };
        warn!(command, "Crashing host");
        let output = run("cmd", &args(&["/c", command])).await?;
        Ok(text(&output))
    }

    fn event_log_collect(&self, dest_dir: &str) -> Vec<String> {
        ["Application", "System"]
            .iter()
            .map(|log| {
                format!(
                    "wevtutil qe {log} /f:text /rd:true /c:2000 > {}",
                    shell_words::quote(&format!("{dest_dir}/event-{log}.log"))
                )
            })
            .collect()
    }

    fn boot_time(&self) -> Result<DateTime<Utc>> {
        let output = std::process::Command::new("wmic")
            .args(["os", "get", "lastbootuptime"])
            .output()
            .context("Failed to run wmic")?;
        parse_wmic_boot_time(&text(&output)).context("Unrecognised wmic boot time output")
    }
}
