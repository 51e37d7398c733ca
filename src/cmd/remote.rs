//! Agent mode: run the requested verbs on this host.

use powercycle::agent::{self, Agent};
use powercycle::cli::Cli;
use powercycle_common::HostFamily;
use tracing::error;

/// Returns the process exit code.
pub async fn run_agent(cli: &Cli) -> i32 {
    let Some(request) = cli.remote_request() else {
        error!("Agent mode needs --remoteOperation");
        return 1;
    };
    let agent = match Agent::load(request, HostFamily::current().layout()) {
        Ok(agent) => agent,
        Err(err) => {
            error!("{err:#}");
            return 1;
        }
    };
    agent::exit_code(&agent.run().await)
}
