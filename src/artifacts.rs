//! Artifact collection from the agent host.
//!
//! Every step is best effort: a missing directory, a failing `tar` or a
//! lost copy is logged and skipped, never turned into a run failure.

use crate::supervisor::{HostPlatform, platform_for};
use crate::transport::{RemoteShell, shell_best_effort};
use powercycle_common::{AgentLayout, HostFamily};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct ArtifactCollector {
    layout: AgentLayout,
    family: HostFamily,
    platform: Box<dyn HostPlatform>,
    dest: PathBuf,
}

impl ArtifactCollector {
    pub fn new(layout: AgentLayout, family: HostFamily, dest: impl Into<PathBuf>) -> Self {
        Self {
            layout,
            family,
            platform: platform_for(family),
            dest: dest.into(),
        }
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Remote archive name for `iteration`.
    pub fn archive_name(iteration: u32, failed: bool) -> String {
        if failed {
            format!("powercycle-artifacts-{iteration}.tgz")
        } else {
            format!("mongod-log-{iteration}.tgz")
        }
    }

    /// Paths archived for `iteration`. Failure archives carry the whole
    /// server state; success archives only the log.
    pub fn archive_members(&self, failed: bool) -> Vec<String> {
        let log_dir = parent_dir(&self.layout.log_path);
        if !failed {
            return vec![log_dir];
        }
        let mut members = vec![
            log_dir,
            self.layout.db_path.clone(),
            format!("{}/data-beforerecovery-*", self.layout.remote_dir),
            format!("{}/data-afterrecovery-*", self.layout.remote_dir),
        ];
        if self.family == HostFamily::Windows {
            members.push(format!("{}/event-*.log", self.layout.remote_dir));
        }
        members
    }

    pub async fn collect(&self, shell: &dyn RemoteShell, iteration: u32, failed: bool) {
        if let Err(err) = std::fs::create_dir_all(&self.dest) {
            warn!(dest = %self.dest.display(), error = %err, "Cannot create artifact directory");
            return;
        }
        info!(iteration, failed, "Collecting artifacts");
        if failed {
            self.export_event_logs(shell).await;
        }
        self.archive(shell, iteration, failed).await;
        self.collect_cores(shell).await;
        self.collect_monitor(shell).await;
    }

    async fn export_event_logs(&self, shell: &dyn RemoteShell) {
        for command in self.platform.event_log_collect(&self.layout.remote_dir) {
            shell_best_effort(shell, &command, None).await;
        }
    }

    async fn archive(&self, shell: &dyn RemoteShell, iteration: u32, failed: bool) {
        let archive = format!(
            "{}/{}",
            self.layout.remote_dir,
            Self::archive_name(iteration, failed)
        );
        let command = format!(
            "tar czf {archive} --ignore-failed-read {}",
            self.archive_members(failed).join(" ")
        );
        shell_best_effort(shell, &command, None).await;
        self.fetch(shell, archive).await;
    }

    async fn collect_cores(&self, shell: &dyn RemoteShell) {
        let cores = &self.layout.cores_dir;
        let command = format!(
            "mkdir -p {cores} && find / -xdev -name '*{suffix}' -not -path '{cores}/*' -exec mv {{}} {cores} \\; ; ls {cores}/*{suffix}",
            suffix = self.platform.core_suffix(),
        );
        match shell.shell(&command, None).await {
            Ok(result) if result.success() => {
                info!(cores = %result.output.trim(), "Core files found");
                self.fetch(shell, cores.clone()).await;
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "Core file search failed"),
        }
    }

    async fn collect_monitor(&self, shell: &dyn RemoteShell) {
        let monitor = &self.layout.monitor_dir;
        let archive = format!("{}/monitor.tgz", self.layout.remote_dir);
        let command = format!(
            "test -d {monitor} && tar czf {archive} -C {} {}",
            parent_dir(monitor),
            base_name(monitor)
        );
        match shell.shell(&command, None).await {
            Ok(result) if result.success() => self.fetch(shell, archive).await,
            Ok(_) => {}
            Err(err) => warn!(error = %err, "Monitor archive failed"),
        }
    }

    async fn fetch(&self, shell: &dyn RemoteShell, remote: String) {
        match shell.copy_from(&[remote.clone()], &self.dest).await {
            Ok(result) if result.success() => info!(%remote, "Artifact fetched"),
            Ok(result) => warn!(%remote, output = %result.output.trim(), "Artifact copy failed"),
            Err(err) => warn!(%remote, error = %err, "Artifact copy failed"),
        }
    }
}

fn parent_dir(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => ".".to_string(),
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use crate::transport::CommandOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingShell {
        commands: Mutex<Vec<String>>,
        fetched: Mutex<Vec<String>>,
        no_cores: bool,
    }

    #[async_trait]
    impl RemoteShell for RecordingShell {
        fn user_host(&self) -> &str {
            "u@h"
        }
        async fn probe(&self) -> Result<CommandOutput, TransportError> {
            Ok(CommandOutput::default())
        }
        async fn shell(&self, command: &str, _: Option<&str>) -> Result<CommandOutput, TransportError> {
            self.commands.lock().unwrap().push(command.to_string());
            let exit_code = if self.no_cores && command.contains("find /") { 2 } else { 0 };
            Ok(CommandOutput {
                exit_code,
                output: String::new(),
            })
        }
        async fn copy_to(&self, _: &[PathBuf], _: Option<&str>) -> Result<CommandOutput, TransportError> {
            Ok(CommandOutput::default())
        }
        async fn copy_from(&self, paths: &[String], _: &Path) -> Result<CommandOutput, TransportError> {
            self.fetched.lock().unwrap().extend(paths.iter().cloned());
            Err(TransportError::Channel {
                user_host: "u@h".into(),
                exit_code: 255,
                output: "ssh: connect to host h port 22: Connection refused".into(),
            })
        }
    }

    #[test]
    fn test_archive_members() {
        let linux = ArtifactCollector::new(HostFamily::Linux.layout(), HostFamily::Linux, ".");
        assert_eq!(linux.archive_members(false), vec!["/log/powercycle/log"]);
        let failed = linux.archive_members(true);
        assert!(failed.contains(&"/data/db".to_string()));
        assert!(failed.contains(&"/log/powercycle/data-afterrecovery-*".to_string()));
        assert!(!failed.iter().any(|m| m.contains("event-")));

        let windows =
            ArtifactCollector::new(HostFamily::Windows.layout(), HostFamily::Windows, ".");
        assert!(windows.archive_members(true).contains(&"C:/log/powercycle/event-*.log".to_string()));
    }

    #[test]
    fn test_archive_names() {
        assert_eq!(ArtifactCollector::archive_name(2, true), "powercycle-artifacts-2.tgz");
        assert_eq!(ArtifactCollector::archive_name(2, false), "mongod-log-2.tgz");
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(parent_dir("/log/powercycle/monitor"), "/log/powercycle");
        assert_eq!(parent_dir("/monitor"), "/");
        assert_eq!(base_name("/log/powercycle/monitor"), "monitor");
    }

    #[tokio::test]
    async fn test_failed_collection_survives_copy_errors() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("artifacts");
        let collector = ArtifactCollector::new(HostFamily::Linux.layout(), HostFamily::Linux, &dest);
        let shell = RecordingShell::default();

        collector.collect(&shell, 3, true).await;

        assert!(dest.is_dir());
        let commands = shell.commands.lock().unwrap();
        assert!(commands[0].starts_with("tar czf /log/powercycle/powercycle-artifacts-3.tgz"));
        assert!(commands[1].contains("find / -xdev -name '*.core'"));
        assert!(commands[2].contains("monitor.tgz"));
        let fetched = shell.fetched.lock().unwrap();
        assert_eq!(
            *fetched,
            vec![
                "/log/powercycle/powercycle-artifacts-3.tgz".to_string(),
                "/log/powercycle/cores".to_string(),
                "/log/powercycle/monitor.tgz".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_no_cores_means_no_core_copy() {
        let dir = tempdir().unwrap();
        let collector =
            ArtifactCollector::new(HostFamily::Linux.layout(), HostFamily::Linux, dir.path());
        let shell = RecordingShell {
            no_cores: true,
            ..RecordingShell::default()
        };
        collector.collect(&shell, 1, false).await;
        let fetched = shell.fetched.lock().unwrap();
        assert!(fetched.iter().any(|p| p.ends_with("mongod-log-1.tgz")));
        assert!(!fetched.iter().any(|p| p.ends_with("cores")));
    }

    #[tokio::test]
    async fn test_windows_failure_exports_event_logs() {
        let dir = tempdir().unwrap();
        let collector =
            ArtifactCollector::new(HostFamily::Windows.layout(), HostFamily::Windows, dir.path());
        let shell = RecordingShell::default();
        collector.collect(&shell, 1, true).await;
        let commands = shell.commands.lock().unwrap();
        assert!(commands.iter().take(2).all(|c| c.starts_with("wevtutil")));
        assert!(commands.iter().any(|c| c.contains("*.mdmp")));
    }
}
