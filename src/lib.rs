//! tokensnap: Chandy-Lamport global snapshots over FIFO token-passing links.
//!
//! The crate is split in two layers:
//! - [`protocol`]: the snapshot state machine. Servers, links, snapshot
//!   records and the [`protocol::Delivery`] seam through which a delivery
//!   engine drives them.
//! - [`sim`]: delivery engines built on that seam. A deterministic
//!   tick-based simulator, a threaded cluster, scenario scripts and an
//!   invariant checker.

pub mod protocol;
pub mod sim;

mod sync;
