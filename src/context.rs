//! The run context: everything that has to be released when the driver
//! exits, however it exits.
//!
//! `finish` is the normal exit path. If the context is dropped without it
//! (a panic, an early return), `Drop` performs the same cleanup
//! synchronously and records the run as failed.

use crate::registry::{ProcessRegistry, TempRegistry};
use crate::report::ReportWriter;
use tracing::{error, info};

pub struct RunContext {
    report: ReportWriter,
    pub processes: ProcessRegistry,
    pub temp_files: TempRegistry,
    finished: bool,
}

impl RunContext {
    pub fn new(report: ReportWriter) -> Self {
        Self {
            report,
            processes: ProcessRegistry::new(),
            temp_files: TempRegistry::new(),
            finished: false,
        }
    }

    pub fn record_ssh_failure(&mut self, message: impl Into<String>) {
        self.report.record_ssh_failure(message);
    }

    pub fn ssh_failure(&self) -> Option<&str> {
        self.report.ssh_failure()
    }

    /// Write both report files, kill every child, delete every temp file.
    /// Returns `exit_code` for the process to exit with.
    pub async fn finish(mut self, exit_code: i32) -> i32 {
        self.finished = true;
        self.write_reports(exit_code);
        self.processes.drain().await;
        self.temp_files.delete_all();
        info!(exit_code, "Run finished");
        exit_code
    }

    fn write_reports(&mut self, exit_code: i32) {
        if let Err(err) = self.report.write(exit_code) {
            error!(error = %err, "Failed to write reports");
        }
    }
}

impl Drop for RunContext {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        error!("Run context dropped without finishing, recording failure");
        self.write_reports(1);
        self.processes.drain_blocking();
        self.temp_files.delete_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{ExitStatus, Report, TestStatus};
    use std::path::Path;
    use tempfile::tempdir;

    fn context(dir: &Path) -> RunContext {
        let writer = ReportWriter::new(
            &dir.join("report.json"),
            &dir.join("powercycle_exit.yml"),
            "powercycle",
        )
        .unwrap();
        RunContext::new(writer)
    }

    fn read_exit(dir: &Path) -> ExitStatus {
        serde_yaml::from_str(&std::fs::read_to_string(dir.join("powercycle_exit.yml")).unwrap())
            .unwrap()
    }

    #[tokio::test]
    async fn test_finish_writes_reports_and_cleans_up() {
        let dir = tempdir().unwrap();
        let mut ctx = context(dir.path());
        let temp = ctx.temp_files.create("crud-", ".yml", b"x").unwrap();

        assert_eq!(ctx.finish(0).await, 0);
        assert!(!temp.exists());
        assert_eq!(read_exit(dir.path()).exit_code, 0);
    }

    #[test]
    fn test_drop_without_finish_records_failure() {
        let dir = tempdir().unwrap();
        let temp;
        {
            let mut ctx = context(dir.path());
            ctx.record_ssh_failure("ssh: connect to host h port 22: Connection timed out");
            temp = ctx.temp_files.create("fsm-", ".yml", b"x").unwrap();
        }
        assert!(!temp.exists());
        let exit = read_exit(dir.path());
        assert_eq!(exit.exit_code, 1);
        assert!(exit.ec2_ssh_failure.unwrap().contains("timed out"));

        let report: Report =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("report.json")).unwrap())
                .unwrap();
        assert_eq!(report.results[0].status, TestStatus::Fail);
    }
}
