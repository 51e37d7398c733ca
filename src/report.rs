//! `report.json` and `powercycle_exit.yml`.
//!
//! The report starts out as a single failing result so that a run killed
//! before it finishes still leaves a failing report behind. An existing
//! report file is loaded and updated rather than replaced.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub status: TestStatus,
    pub test_file: String,
    pub exit_code: i32,
    /// Seconds.
    pub elapsed: i64,
    /// Unix seconds.
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub failures: u32,
    pub results: Vec<TestResult>,
}

impl Report {
    pub fn new(test_file: &str) -> Self {
        let now = Utc::now().timestamp();
        Self {
            failures: 0,
            results: vec![TestResult {
                status: TestStatus::Fail,
                test_file: test_file.to_string(),
                exit_code: 0,
                elapsed: 0,
                start: now,
                end: now,
            }],
        }
    }

    /// Record the outcome on the first result.
    pub fn finish(&mut self, success: bool, exit_code: i32) {
        let end = Utc::now().timestamp();
        self.failures = if success { 0 } else { 1 };
        if let Some(result) = self.results.first_mut() {
            result.status = if success {
                TestStatus::Pass
            } else {
                TestStatus::Fail
            };
            result.exit_code = exit_code;
            result.end = end;
            result.elapsed = end - result.start;
        }
    }
}

/// Contents of `powercycle_exit.yml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ec2_ssh_failure: Option<String>,
}

pub struct ReportWriter {
    report_path: PathBuf,
    exit_path: PathBuf,
    report: Report,
    ssh_failure: Option<String>,
}

impl ReportWriter {
    /// Load `report_path` if it exists, otherwise start a fresh report for
    /// `test_file`.
    pub fn new(report_path: &Path, exit_path: &Path, test_file: &str) -> Result<Self> {
        let report = if report_path.exists() {
            let content = fs::read_to_string(report_path)
                .with_context(|| format!("Failed to read {}", report_path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", report_path.display()))?
        } else {
            Report::new(test_file)
        };
        Ok(Self {
            report_path: report_path.to_path_buf(),
            exit_path: exit_path.to_path_buf(),
            report,
            ssh_failure: None,
        })
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    /// Remember the transport failure that ended the run. The first one wins.
    pub fn record_ssh_failure(&mut self, message: impl Into<String>) {
        if self.ssh_failure.is_none() {
            self.ssh_failure = Some(message.into());
        }
    }

    pub fn ssh_failure(&self) -> Option<&str> {
        self.ssh_failure.as_deref()
    }

    /// Finalize and write both files.
    pub fn write(&mut self, exit_code: i32) -> Result<()> {
        self.report.finish(exit_code == 0, exit_code);
        let json = serde_json::to_string_pretty(&self.report).context("Failed to serialize report")?;
        fs::write(&self.report_path, json)
            .with_context(|| format!("Failed to write {}", self.report_path.display()))?;

        let exit = ExitStatus {
            exit_code,
            ec2_ssh_failure: self.ssh_failure.clone(),
        };
        let yaml = serde_yaml::to_string(&exit).context("Failed to serialize exit status")?;
        fs::write(&self.exit_path, yaml)
            .with_context(|| format!("Failed to write {}", self.exit_path.display()))?;
        Ok(())
    }
}
