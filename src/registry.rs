//! Registries of resources the driver must clean up on every exit path:
//! spawned child processes and temporary files.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How long a synchronous drain waits for a killed child to be reaped.
const BLOCKING_REAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Children spawned by the driver, keyed by PID. Each child leads its own
/// process group so its descendants die with it.
#[derive(Default)]
pub struct ProcessRegistry {
    children: BTreeMap<u32, Child>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&mut self, mut command: Command) -> Result<u32> {
        #[cfg(unix)]
        command.process_group(0);
        command.stdin(Stdio::null()).kill_on_drop(true);
        let child = command.spawn().context("Failed to spawn child process")?;
        let pid = child
            .id()
            .context("Spawned child exited before its PID was read")?;
        debug!(pid, "Registered child process");
        self.children.insert(pid, child);
        Ok(pid)
    }

    pub fn pids(&self) -> Vec<u32> {
        self.children.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Kill every child and its descendants, then wait for each. Children
    /// that already exited are reaped silently.
    pub async fn drain(&mut self) {
        for (pid, mut child) in std::mem::take(&mut self.children) {
            kill_tree(pid);
            if let Err(err) = child.kill().await {
                debug!(pid, error = %err, "Child already gone");
            }
        }
    }

    /// Same as [`drain`](Self::drain) for contexts that cannot await.
    pub fn drain_blocking(&mut self) {
        for (pid, mut child) in std::mem::take(&mut self.children) {
            kill_tree(pid);
            let _ = child.start_kill();
            let started = Instant::now();
            loop {
                match child.try_wait() {
                    Ok(Some(_)) | Err(_) => break,
                    Ok(None) if started.elapsed() >= BLOCKING_REAP_TIMEOUT => {
                        warn!(pid, "Child did not exit after kill");
                        break;
                    }
                    Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                }
            }
        }
    }
}

#[cfg(unix)]
fn kill_tree(pid: u32) {
    // SAFETY: killpg only sends a signal; an unknown group yields ESRCH.
    unsafe {
        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(windows)]
fn kill_tree(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .output();
}

/// Temporary files, all created inside one private directory.
#[derive(Default)]
pub struct TempRegistry {
    dir: Option<TempDir>,
    files: Vec<PathBuf>,
}

impl TempRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn dir(&mut self) -> Result<&Path> {
        if self.dir.is_none() {
            let dir = tempfile::Builder::new()
                .prefix("powercycle-")
                .tempdir()
                .context("Failed to create private temp directory")?;
            self.dir = Some(dir);
        }
        self.dir
            .as_ref()
            .map(TempDir::path)
            .context("Temp directory missing")
    }

    /// Create a file with `contents` and register it for deletion.
    pub fn create(&mut self, prefix: &str, suffix: &str, contents: &[u8]) -> Result<PathBuf> {
        let dir = self.dir()?.to_path_buf();
        let file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(&dir)
            .context("Failed to create temp file")?;
        let (mut handle, path) = file.keep().context("Failed to keep temp file")?;
        handle
            .write_all(contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        self.files.push(path.clone());
        Ok(path)
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Delete every registered file. Returns how many were removed.
    pub fn delete_all(&mut self) -> usize {
        let mut removed = 0;
        for path in self.files.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), error = %err, "Failed to delete temp file"),
            }
        }
        removed
    }
}
