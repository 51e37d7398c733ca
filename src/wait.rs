//! Bounded-retry polling.
//!
//! Every "wait until the server is up / stopped / primary" loop in the
//! harness goes through [`wait_until`], so timeouts and intervals are
//! explicit values rather than ad-hoc sleeps.

use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Total time budget.
    pub timeout: Duration,
    /// Pause between attempts.
    pub interval: Duration,
}

impl WaitPolicy {
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    pub const fn secs(timeout: u64, interval: u64) -> Self {
        Self::new(Duration::from_secs(timeout), Duration::from_secs(interval))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitTimeout {
    pub attempts: u32,
    pub elapsed: Duration,
    /// Message of the last failed attempt, if the probe errored.
    pub last_error: Option<String>,
}

impl std::fmt::Display for WaitTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "gave up after {} attempts in {:.1}s",
            self.attempts,
            self.elapsed.as_secs_f64()
        )?;
        if let Some(err) = &self.last_error {
            write!(f, " (last error: {err})")?;
        }
        Ok(())
    }
}

/// Poll `probe` until it returns `Ok(true)` or the policy's budget runs
/// out. A probe error counts as "not yet". The probe always runs at least
/// once, and no single attempt may outlive the remaining budget.
///
/// Returns the number of attempts made.
pub async fn wait_until<F, Fut, E>(policy: WaitPolicy, mut probe: F) -> Result<u32, WaitTimeout>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut attempts = 0;
    let mut last_error = None;

    loop {
        attempts += 1;
        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));
        match timeout(remaining, probe()).await {
            Ok(Ok(true)) => return Ok(attempts),
            Ok(Ok(false)) => {}
            Ok(Err(err)) => last_error = Some(err.to_string()),
            Err(_) => last_error = Some("attempt timed out".to_string()),
        }

        let now = Instant::now();
        if now + policy.interval > deadline {
            return Err(WaitTimeout {
                attempts,
                elapsed: now - started,
                last_error,
            });
        }
        sleep(policy.interval).await;
    }
}
