//! Crash injector.
//!
//! Waits a jittered delay so the server is under load, runs the pre-crash
//! hook (the canary insert), then takes the server down: a hard kill of the
//! server process, or an OS-level crash of the whole host.

use crate::agent::AgentClient;
use crate::errors::{PowercycleError, ProtocolError};
use crate::transport::RemoteShell;
use powercycle_common::{CrashMethod, RemoteOperation, RemoteRequest};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::info;

/// Exit status of an ssh session whose host went away under it.
const SESSION_LOST_EXIT_CODE: i32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashSchedule {
    pub wait: Duration,
    pub jitter: Duration,
}

impl Default for CrashSchedule {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(30),
            jitter: Duration::from_secs(10),
        }
    }
}

impl CrashSchedule {
    pub fn secs(wait: u64, jitter: u64) -> Self {
        Self {
            wait: Duration::from_secs(wait),
            jitter: Duration::from_secs(jitter),
        }
    }

    /// Uniform in `[wait - jitter, wait + jitter]`, floored at zero.
    pub fn delay(&self) -> Duration {
        let low = self.wait.saturating_sub(self.jitter);
        let high = self.wait + self.jitter;
        if low >= high {
            return low;
        }
        let (low, high) = (low.as_millis() as u64, high.as_millis() as u64);
        Duration::from_millis(rand::rng().random_range(low..=high))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashOutcome {
    /// The server process was killed and reported stopped.
    Killed,
    /// The host went down; the transport session died with it.
    HostCrashed,
}

pub struct CrashInjector<'a> {
    shell: &'a dyn RemoteShell,
    agent: &'a AgentClient,
    method: CrashMethod,
    schedule: CrashSchedule,
    /// Pause after a host crash before the host is probed again.
    settle: Duration,
}

impl<'a> CrashInjector<'a> {
    pub fn new(
        shell: &'a dyn RemoteShell,
        agent: &'a AgentClient,
        method: CrashMethod,
        schedule: CrashSchedule,
        settle: Duration,
    ) -> Self {
        Self {
            shell,
            agent,
            method,
            schedule,
            settle,
        }
    }

    /// Wait, run `pre_crash`, crash. The hook's failure aborts the crash.
    pub async fn crash<F>(&self, pre_crash: F) -> Result<CrashOutcome, PowercycleError>
    where
        F: Future<Output = Result<(), PowercycleError>>,
    {
        let delay = self.schedule.delay();
        info!(method = %self.method, delay_secs = delay.as_secs_f64(), "Crash scheduled");
        tokio::time::sleep(delay).await;

        pre_crash.await?;

        match self.method {
            CrashMethod::Kill => {
                self.agent
                    .run(self.shell, RemoteRequest::new(RemoteOperation::KillMongod))
                    .await?;
                info!("Server killed");
                Ok(CrashOutcome::Killed)
            }
            CrashMethod::Internal => {
                let result = self
                    .agent
                    .run_once(self.shell, RemoteRequest::new(RemoteOperation::CrashServer))
                    .await;
                match result {
                    Err(PowercycleError::Transport(err)) => {
                        info!(output = %err.output().trim(), "Transport lost, crash delivered");
                    }
                    Err(PowercycleError::RemoteCommand(err))
                        if err.exit_code == SESSION_LOST_EXIT_CODE =>
                    {
                        info!(output = %err.output.trim(), "Session dropped, crash delivered");
                    }
                    Err(err) => return Err(err),
                    Ok(out) => {
                        return Err(ProtocolError::CrashNotDelivered {
                            output: out.output,
                        }
                        .into());
                    }
                }
                tokio::time::sleep(self.settle).await;
                Ok(CrashOutcome::HostCrashed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentDefaults;
    use crate::errors::TransportError;
    use crate::transport::CommandOutput;
    use async_trait::async_trait;
    use powercycle_common::HostFamily;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    enum Reply {
        Exit(i32),
        Lost,
    }

    struct CrashShell {
        reply: Reply,
        commands: Mutex<Vec<String>>,
        once: Mutex<u32>,
    }

    impl CrashShell {
        fn new(reply: Reply) -> Self {
            Self {
                reply,
                commands: Mutex::new(Vec::new()),
                once: Mutex::new(0),
            }
        }

        fn answer(&self, command: &str) -> Result<CommandOutput, TransportError> {
            self.commands.lock().unwrap().push(command.to_string());
            match self.reply {
                Reply::Exit(exit_code) => Ok(CommandOutput {
                    exit_code,
                    output: String::new(),
                }),
                Reply::Lost => Err(TransportError::Channel {
                    user_host: "u@h".into(),
                    exit_code: 255,
                    output: "ssh: connect to host h port 22: Connection refused".into(),
                }),
            }
        }
    }

    #[async_trait]
    impl RemoteShell for CrashShell {
        fn user_host(&self) -> &str {
            "u@h"
        }
        async fn probe(&self) -> Result<CommandOutput, TransportError> {
            Ok(CommandOutput::default())
        }
        async fn shell(&self, command: &str, _: Option<&str>) -> Result<CommandOutput, TransportError> {
            self.answer(command)
        }
        async fn shell_once(
            &self,
            command: &str,
            _: Option<&str>,
        ) -> Result<CommandOutput, TransportError> {
            *self.once.lock().unwrap() += 1;
            self.answer(command)
        }
        async fn copy_to(&self, _: &[PathBuf], _: Option<&str>) -> Result<CommandOutput, TransportError> {
            Ok(CommandOutput::default())
        }
        async fn copy_from(&self, _: &[String], _: &Path) -> Result<CommandOutput, TransportError> {
            Ok(CommandOutput::default())
        }
    }

    fn agent() -> AgentClient {
        AgentClient::new(
            &HostFamily::Linux.layout(),
            HostFamily::Linux,
            AgentDefaults::default(),
        )
    }

    fn injector<'a>(shell: &'a CrashShell, agent: &'a AgentClient, method: CrashMethod) -> CrashInjector<'a> {
        CrashInjector::new(
            shell,
            agent,
            method,
            CrashSchedule::secs(0, 0),
            Duration::ZERO,
        )
    }

    #[test]
    fn test_delay_stays_within_jitter() {
        let schedule = CrashSchedule::secs(30, 10);
        for _ in 0..200 {
            let d = schedule.delay();
            assert!(d >= Duration::from_secs(20) && d <= Duration::from_secs(40), "{d:?}");
        }
        assert_eq!(CrashSchedule::secs(5, 0).delay(), Duration::from_secs(5));
        let floored = CrashSchedule::secs(2, 10).delay();
        assert!(floored <= Duration::from_secs(12));
    }

    #[tokio::test]
    async fn test_kill_runs_hook_then_kills() {
        let shell = CrashShell::new(Reply::Exit(0));
        let agent = agent();
        let hook_ran = Mutex::new(false);
        let outcome = injector(&shell, &agent, CrashMethod::Kill)
            .crash(async {
                assert!(shell.commands.lock().unwrap().is_empty());
                *hook_ran.lock().unwrap() = true;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(outcome, CrashOutcome::Killed);
        assert!(*hook_ran.lock().unwrap());
        assert!(shell.commands.lock().unwrap()[0].contains("--remoteOperation kill_mongod"));
    }

    #[tokio::test]
    async fn test_lost_transport_means_crash_delivered() {
        let shell = CrashShell::new(Reply::Lost);
        let agent = agent();
        let outcome = injector(&shell, &agent, CrashMethod::Internal)
            .crash(async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(outcome, CrashOutcome::HostCrashed);
        assert_eq!(*shell.once.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_session_means_crash_delivered() {
        let shell = CrashShell::new(Reply::Exit(255));
        let agent = agent();
        let outcome = injector(&shell, &agent, CrashMethod::Internal)
            .crash(async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(outcome, CrashOutcome::HostCrashed);
    }

    #[tokio::test]
    async fn test_agent_surviving_the_crash_is_a_failure() {
        let shell = CrashShell::new(Reply::Exit(3));
        let agent = agent();
        let err = injector(&shell, &agent, CrashMethod::Internal)
            .crash(async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PowercycleError::Protocol(ProtocolError::RemoteOperation { .. })
        ));
    }

    #[tokio::test]
    async fn test_hook_failure_aborts_crash() {
        let shell = CrashShell::new(Reply::Exit(0));
        let agent = agent();
        let err = injector(&shell, &agent, CrashMethod::Kill)
            .crash(async { Err::<(), PowercycleError>(ProtocolError::NotPrimary { port: 27017 }.into()) })
            .await
            .unwrap_err();
        assert!(matches!(err, PowercycleError::Protocol(_)));
        assert!(shell.commands.lock().unwrap().is_empty());
    }
}
