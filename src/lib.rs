pub mod agent;
pub mod artifacts;
pub mod canary;
pub mod cli;
pub mod context;
pub mod controller;
pub mod crash;
pub mod diagnostics;
pub mod errors;
pub mod logging;
pub mod registry;
pub mod report;
pub mod rpc;
pub mod supervisor;
pub mod transport;
pub mod wait;
pub mod workload;
