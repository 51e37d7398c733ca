//! Diagnostic trigger.
//!
//! An operator can ask a hung driver for a stack dump: SIGUSR1 on POSIX,
//! Ctrl-Break on Windows consoles. The driver then logs a backtrace plus
//! its live children and exits through the normal exit handler with code 1.

use crate::context::RunContext;
use std::backtrace::Backtrace;
use tracing::{error, warn};

/// Resolves when the trigger fires. Never resolves if the trigger cannot be
/// installed.
pub async fn triggered() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::user_defined1()) {
            Ok(mut sigusr1) => {
                sigusr1.recv().await;
                return;
            }
            Err(err) => warn!(error = %err, "Could not install SIGUSR1 handler"),
        }
    }
    #[cfg(windows)]
    {
        match tokio::signal::windows::ctrl_break() {
            Ok(mut ctrl_break) => {
                ctrl_break.recv().await;
                return;
            }
            Err(err) => warn!(error = %err, "Could not install Ctrl-Break handler"),
        }
    }
    std::future::pending::<()>().await
}

pub fn dump(ctx: &RunContext) {
    let backtrace = Backtrace::force_capture();
    error!(
        children = ?ctx.processes.pids(),
        "Diagnostic trigger received, dumping stack\n{backtrace}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigusr1_fires_trigger() {
        let waiter = tokio::spawn(triggered());
        // Let the handler install before signalling.
        tokio::time::sleep(Duration::from_millis(100)).await;
        // SAFETY: signalling our own process.
        unsafe {
            libc::kill(libc::getpid(), libc::SIGUSR1);
        }
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("trigger fired")
            .unwrap();
    }
}
