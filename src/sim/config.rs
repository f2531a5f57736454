//! Delivery engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default seed for the simulator's receive-time generator.
pub const DEFAULT_SEED: u64 = 8053172852482175524;

/// Default upper bound (exclusive) on extra transit ticks.
pub const DEFAULT_MAX_DELAY: u64 = 5;

/// Default tick budget for a `run_until_*` call.
pub const DEFAULT_MAX_TICKS: u64 = 10_000;

/// Configuration for the deterministic [`super::Simulator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Seed for receive-time jitter. Same seed, same run.
    pub seed: u64,
    /// Events arrive between 1 and `max_delay` ticks after they are sent.
    /// Zero means always exactly one tick.
    pub max_delay: u64,
    /// Ticks a `run_until_*` call may spend before giving up.
    pub max_ticks: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            seed: DEFAULT_SEED,
            max_delay: DEFAULT_MAX_DELAY,
            max_ticks: DEFAULT_MAX_TICKS,
        }
    }
}

/// Configuration for the threaded [`super::Cluster`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Range of transit latency added to each queued event.
    pub latency_range: (Duration, Duration),
    /// How long a link worker sleeps when its head event is not yet due.
    pub poll_interval: Duration,
    /// Seed for latency jitter. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            latency_range: (Duration::ZERO, Duration::from_millis(2)),
            poll_interval: Duration::from_micros(200),
            seed: None,
        }
    }
}
