//! POSIX host: the server forks itself and is tracked through `/proc`.

use super::{HostPlatform, ServerInstance, ServerState};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use powercycle_common::HostFamily;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct PosixPlatform;

impl PosixPlatform {
    pub fn new() -> Self {
        Self
    }
}

/// PIDs of every process whose command name is `name`.
pub fn pids_named(proc_root: &Path, name: &str) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return Vec::new();
    };
    let mut pids: Vec<u32> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
            let comm = std::fs::read_to_string(entry.path().join("comm")).ok()?;
            (comm.trim() == name).then_some(pid)
        })
        .collect();
    pids.sort_unstable();
    pids
}

/// Running means a live process plus a non-empty lock file.
fn state_from(pids: &[u32], lock_file: &Path) -> ServerState {
    if pids.is_empty() {
        return ServerState::Stopped;
    }
    match std::fs::metadata(lock_file) {
        Ok(meta) if meta.len() > 0 => ServerState::Running,
        _ => ServerState::Stopped,
    }
}

fn signal_all(pids: &[u32], signal: libc::c_int) {
    for &pid in pids {
        // SAFETY: kill only sends a signal; a vanished PID yields ESRCH.
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc != 0 {
            debug!(pid, signal, "Signal not delivered");
        }
    }
}

/// Parse the `btime` line of `/proc/stat`.
pub fn parse_btime(stat: &str) -> Option<DateTime<Utc>> {
    stat.lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|secs| secs.trim().parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

fn sudo_prefix(sudo: bool) -> &'static str {
    if sudo { "sudo " } else { "" }
}

#[async_trait]
impl HostPlatform for PosixPlatform {
    fn family(&self) -> HostFamily {
        HostFamily::Linux
    }

    async fn install(&self, instance: &ServerInstance) -> Result<()> {
        debug!(binary = %instance.binary().display(), "Nothing to register on POSIX");
        Ok(())
    }

    async fn start(&self, instance: &ServerInstance) -> Result<()> {
        let binary = instance.binary();
        let output = Command::new(&binary)
            .args(instance.options.to_args())
            .output()
            .await
            .with_context(|| format!("Failed to launch {}", binary.display()))?;
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                binary.display(),
                output.status,
                text.trim()
            );
        }
        info!(output = %text.trim(), "Server forked");
        Ok(())
    }

    async fn stop(&self, instance: &ServerInstance) -> Result<()> {
        let pids = pids_named(Path::new("/proc"), &instance.binary_name);
        info!(?pids, "Sending SIGTERM");
        signal_all(&pids, libc::SIGTERM);
        Ok(())
    }

    async fn status(&self, instance: &ServerInstance) -> ServerState {
        let pids = pids_named(Path::new("/proc"), &instance.binary_name);
        state_from(&pids, &instance.lock_file())
    }

    async fn kill(&self, instance: &ServerInstance) -> Result<()> {
        let pids = pids_named(Path::new("/proc"), &instance.binary_name);
        info!(?pids, "Sending SIGKILL");
        signal_all(&pids, libc::SIGKILL);
        Ok(())
    }

    async fn crash_internal(&self, crash_option: Option<&str>, sudo: bool) -> Result<String> {
        let sudo = sudo_prefix(sudo);
        let command = match crash_option {
            Some(custom) => custom.to_string(),
            None => format!(
                "echo 'Server crashing now' | {sudo}wall ; \
                 echo 1 | {sudo}tee /proc/sys/kernel/sysrq ; \
                 echo b | {sudo}tee /proc/sysrq-trigger"
            ),
        };
        warn!(command, "Crashing host");
        let output = Command::new("/bin/sh")
            .arg("-c")
            .arg(&command)
            .output()
            .await
            .context("Failed to run crash command")?;
        Ok(format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ))
    }

    fn event_log_collect(&self, _dest_dir: &str) -> Vec<String> {
        Vec::new()
    }

    fn boot_time(&self) -> Result<DateTime<Utc>> {
        let stat = std::fs::read_to_string("/proc/stat").context("Failed to read /proc/stat")?;
        parse_btime(&stat).context("No btime line in /proc/stat")
    }
}
