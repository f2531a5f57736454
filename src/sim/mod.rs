//! Delivery engines for the snapshot protocol.
//!
//! - [`Simulator`]: deterministic, tick-driven, seeded jitter
//! - [`Cluster`]: one thread per link, wall-clock latency
//! - [`Topology`] / [`Script`]: text scenarios for the simulator
//! - [`Checker`]: conservation and completion invariants

pub mod checker;
pub mod completion;
pub mod config;
pub mod error;
pub mod logger;
pub mod runner;
pub mod script;
pub mod simulator;

#[cfg(test)]
mod tests;

pub use checker::{CheckResult, CheckStats, Checker, Violation, ViolationKind};
pub use completion::CompletionTracker;
pub use config::{ClusterConfig, SimConfig};
pub use error::{ScriptError, SimError};
pub use logger::{Epoch, EventLog};
pub use runner::Cluster;
pub use script::{Script, ScriptEvent, Topology};
pub use simulator::{SimHooks, SimStatus, Simulator};
