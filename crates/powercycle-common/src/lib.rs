//! Shared domain types for the powercycle driver and agent.

pub mod layout;
pub mod mongod_options;
pub mod request;
pub mod task_config;

pub use layout::{AgentLayout, HostCaps, HostFamily, SECRET_PORT, STANDARD_PORT};
pub use mongod_options::{MongodOptions, OptionForm};
pub use request::{RemoteOperation, RemoteRequest, RsyncDest};
pub use task_config::{ConfigError, CrashMethod, TaskConfig, TaskProfiles};
