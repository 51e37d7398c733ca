//! Command line shared by the driver and the agent. Passing
//! `--remoteOperation` selects agent mode.

use crate::agent::AgentDefaults;
use crate::crash::CrashSchedule;
use crate::transport::SshOptions;
use anyhow::Result;
use clap::Parser;
use powercycle_common::{RemoteOperation, RemoteRequest, RsyncDest};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "powercycle")]
#[command(
    version,
    about = "Repeatedly crash a database server on a remote host and verify it recovers"
)]
pub struct Cli {
    /// `user@host` of the host under test
    #[arg(long = "sshUserHost", required_unless_present = "remote_operation")]
    pub ssh_user_host: Option<String>,

    /// Extra ssh options appended to the defaults
    #[arg(long = "sshConnection", default_value = "", allow_hyphen_values = true)]
    pub ssh_connection: String,

    /// Retries for the initial reachability probe
    #[arg(long = "sshAccessRetryCount", default_value_t = 5)]
    pub ssh_access_retry_count: u32,

    /// Task profile name; a trailing `_<n>` CI suffix is ignored
    #[arg(long = "taskName")]
    pub task_name: Option<String>,

    /// Server archive URL, or "latest"
    #[arg(long = "downloadUrl")]
    pub download_url: Option<String>,

    /// debug, info, warning or error
    #[arg(long = "logLevel", default_value = "info")]
    pub log_level: String,

    #[arg(long = "logFile")]
    pub log_file: Option<PathBuf>,

    /// Task profile file
    #[arg(long = "configFile", default_value = "config/powercycle_tasks.yml")]
    pub config_file: PathBuf,

    /// CI expansions uploaded to the agent
    #[arg(long = "expansionsFile", default_value = "expansions.yml")]
    pub expansions_file: PathBuf,

    /// Agent binary to upload; defaults to this executable
    #[arg(long = "remoteBinary")]
    pub remote_binary: Option<PathBuf>,

    /// Snapshot the data directory before and after recovery
    #[arg(long)]
    pub rsync: bool,

    /// Command the agent runs to crash the host
    #[arg(long = "crashOption", allow_hyphen_values = true)]
    pub crash_option: Option<String>,

    /// Run iterations until this many seconds have passed; overrides the
    /// task's loop count
    #[arg(long = "testTime")]
    pub test_time: Option<u64>,

    /// Seconds between workload start and the crash
    #[arg(long = "crashWaitTime", default_value_t = 30)]
    pub crash_wait_time: u64,

    /// Seconds of uniform jitter around --crashWaitTime
    #[arg(long = "jitterForCrashWaitTime", default_value_t = 10)]
    pub jitter_for_crash_wait_time: u64,

    /// Run privileged agent commands through sudo
    #[arg(long = "remoteSudo")]
    pub remote_sudo: bool,

    /// Mongo shell used by the driver
    #[arg(long = "mongoPath", default_value = "mongo")]
    pub mongo_path: PathBuf,

    /// Checkout holding buildscripts/resmoke.py and the jstests
    #[arg(long = "mongoRepoRootDir", default_value = ".")]
    pub mongo_repo_root_dir: PathBuf,

    /// Python interpreter for the workload clients
    #[arg(long = "python", default_value = "python")]
    pub python: PathBuf,

    #[arg(long = "reportJsonFile", default_value = "report.json")]
    pub report_json_file: PathBuf,

    #[arg(long = "exitYamlFile", default_value = "powercycle_exit.yml")]
    pub exit_yaml_file: PathBuf,

    /// Local directory for fetched artifacts
    #[arg(long = "artifactDir", default_value = ".")]
    pub artifact_dir: PathBuf,

    #[arg(long = "mongodHost", hide = true)]
    pub mongod_host: Option<String>,

    #[arg(long = "mongodPort", hide = true)]
    pub mongod_port: Option<u16>,

    #[arg(long = "rsyncDest", hide = true, num_args = 2, value_names = ["SRC_DIR", "NEW_DIR"])]
    pub rsync_dest: Option<Vec<String>>,

    #[arg(long = "remoteOperation", hide = true)]
    pub remote_operation: Option<RemoteOperation>,

    /// Further agent verbs, run after --remoteOperation
    #[arg(hide = true)]
    pub operations: Vec<RemoteOperation>,
}

impl Cli {
    pub fn is_agent(&self) -> bool {
        self.remote_operation.is_some()
    }

    /// The agent request carried by this command line.
    pub fn remote_request(&self) -> Option<RemoteRequest> {
        let first = self.remote_operation?;
        let mut request = RemoteRequest::new(first);
        request.operations.extend(self.operations.iter().copied());
        request.task_name = self.task_name.clone();
        request.mongod_host = self.mongod_host.clone();
        request.mongod_port = self.mongod_port;
        request.download_url = self.download_url.clone();
        request.crash_option = self.crash_option.clone();
        request.remote_sudo = self.remote_sudo;
        request.log_level = Some(self.log_level.clone());
        request.rsync_dest = match self.rsync_dest.as_deref() {
            Some([src_dir, new_dir]) => Some(RsyncDest {
                src_dir: src_dir.clone(),
                new_dir: new_dir.clone(),
            }),
            _ => None,
        };
        Some(request)
    }

    pub fn agent_defaults(&self) -> AgentDefaults {
        AgentDefaults {
            task_name: self.task_name.clone(),
            crash_option: self.crash_option.clone(),
            remote_sudo: self.remote_sudo,
            log_level: Some(self.log_level.clone()),
        }
    }

    pub fn ssh_options(&self) -> Result<SshOptions> {
        let mut options = SshOptions::default().with_extra_connection_options(&self.ssh_connection)?;
        options.force_tty = self.remote_sudo;
        options.access_retry_count = self.ssh_access_retry_count;
        Ok(options)
    }

    /// Wall-clock limit for the run. Zero means none.
    pub fn test_time(&self) -> Option<Duration> {
        self.test_time.filter(|secs| *secs > 0).map(Duration::from_secs)
    }

    pub fn crash_schedule(&self) -> CrashSchedule {
        CrashSchedule::secs(self.crash_wait_time, self.jitter_for_crash_wait_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("powercycle").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_agent_request_survives_the_command_line() {
        let sent = RemoteRequest::new(RemoteOperation::RsyncData)
            .then(RemoteOperation::StartMongod)
            .task_name("powercycle_smoke")
            .port(37017)
            .host("db1")
            .rsync("/log/powercycle/data-beforerecovery-0", "/log/powercycle/data-beforerecovery-1");
        let args = sent.to_args();
        let cli = parse(&args.iter().map(String::as_str).collect::<Vec<_>>());

        assert!(cli.is_agent());
        let received = cli.remote_request().unwrap();
        assert_eq!(received.operations, sent.operations);
        assert_eq!(received.mongod_port, Some(37017));
        assert_eq!(received.mongod_host.as_deref(), Some("db1"));
        assert_eq!(received.rsync_dest, sent.rsync_dest);
    }

    #[test]
    fn test_driver_requires_user_host() {
        let err = Cli::try_parse_from(["powercycle", "--taskName", "powercycle"]).unwrap_err();
        assert!(err.to_string().contains("--sshUserHost"));
        let cli = parse(&["--sshUserHost", "u@h", "--rsync", "--crashWaitTime", "5"]);
        assert!(!cli.is_agent());
        assert!(cli.remote_request().is_none());
        assert_eq!(cli.crash_schedule(), CrashSchedule::secs(5, 10));
    }

    #[test]
    fn test_test_time_zero_means_unlimited() {
        assert_eq!(parse(&["--sshUserHost", "u@h"]).test_time(), None);
        assert_eq!(parse(&["--sshUserHost", "u@h", "--testTime", "0"]).test_time(), None);
        assert_eq!(
            parse(&["--sshUserHost", "u@h", "--testTime", "600"]).test_time(),
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn test_unknown_verb_is_rejected() {
        let err = Cli::try_parse_from(["powercycle", "--remoteOperation", "reboot"]).unwrap_err();
        assert!(err.to_string().contains("Invalid remote operation 'reboot'"));
    }

    #[test]
    fn test_ssh_options_follow_flags() {
        let cli = parse(&[
            "--sshUserHost",
            "u@h",
            "--sshConnection",
            "-i /keys/id",
            "--remoteSudo",
            "--sshAccessRetryCount",
            "2",
        ]);
        let options = cli.ssh_options().unwrap();
        assert!(options.force_tty);
        assert_eq!(options.access_retry_count, 2);
        assert!(options.connection_options.ends_with(&["-i".to_string(), "/keys/id".to_string()]));
        assert!(cli.agent_defaults().remote_sudo);
    }
}
