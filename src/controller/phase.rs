use crate::canary::CanaryDocument;
use chrono::NaiveDateTime;
use std::time::Instant;
use tracing::info;

/// Steps of one iteration, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    PreRsync,
    RecoveryStart,
    Validate,
    ShutdownSecret,
    PostRsync,
    StandardStart,
    Workload,
    CanaryInsert,
    Crash,
    PostCrashVerify,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::PreRsync => "pre-rsync",
            Phase::RecoveryStart => "recovery-start",
            Phase::Validate => "validate",
            Phase::ShutdownSecret => "shutdown-secret",
            Phase::PostRsync => "post-rsync",
            Phase::StandardStart => "standard-start",
            Phase::Workload => "workload",
            Phase::CanaryInsert => "canary-insert",
            Phase::Crash => "crash",
            Phase::PostCrashVerify => "post-crash-verify",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct IterationState {
    pub iteration: u32,
    pub phase: Phase,
    pub started: Instant,
    /// Agent boot time reported by the standard-port start.
    pub boot_time: Option<NaiveDateTime>,
    /// On entry the previous iteration's canary; replaced by this
    /// iteration's once it is inserted.
    pub canary: Option<CanaryDocument>,
}

impl IterationState {
    pub fn new(iteration: u32, canary: Option<CanaryDocument>) -> Self {
        Self {
            iteration,
            phase: Phase::PreRsync,
            started: Instant::now(),
            boot_time: None,
            canary,
        }
    }

    pub fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        info!(
            iteration = self.iteration,
            %phase,
            elapsed_secs = self.started.elapsed().as_secs(),
            "Entering phase"
        );
    }
}
