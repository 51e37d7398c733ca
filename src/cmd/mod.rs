//! Entry points.
//!
//! | Module   | Mode                                          |
//! |----------|-----------------------------------------------|
//! | `run`    | driver: `--sshUserHost ...`                   |
//! | `remote` | agent: `--remoteOperation <verb> [verbs...]`  |

pub mod remote;
pub mod run;

pub use remote::run_agent;
pub use run::run_driver;
