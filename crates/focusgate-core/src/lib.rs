pub mod config;
pub mod daemon;
pub mod daemon_control;
pub mod enforcement;
pub mod hosts;
pub mod probe;
pub mod process;
pub mod push;
pub mod remote;
pub mod store;

#[cfg(test)]
mod test_support;

pub use config::AgentConfig;
pub use daemon::Daemon;
pub use enforcement::{markup_requires_block, CycleOutcome, EnforcementLoop, LoopSettings};
pub use hosts::NetworkBlockGate;
pub use store::{ConfigurationStore, PolicyConfig, UserState};
