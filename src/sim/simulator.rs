//! Deterministic discrete-time delivery engine.
//!
//! Time advances in ticks. Every queued event gets a receive time of
//! `now + 1 + jitter`, with jitter drawn from a seeded RNG, so a given seed
//! and script always produce the same run. On each tick, servers are
//! visited in id order; for each one, its outbound links are scanned in
//! destination order and the first link whose head event is due delivers
//! it. At most one event leaves each server per tick, which totally orders
//! the deliveries into every destination.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::protocol::{Delivery, LoggedEvent, ProtocolError, Server, ServerId, SnapshotId};
use crate::sync::lock;

use super::completion::CompletionTracker;
use super::config::SimConfig;
use super::error::SimError;
use super::logger::EventLog;
use super::script::{Script, ScriptEvent, Topology};

/// The simulator's side of the [`Delivery`] seam, shared by every server.
pub struct SimHooks {
    time: AtomicU64,
    max_delay: u64,
    rng: Mutex<StdRng>,
    log: EventLog,
    completions: Mutex<CompletionTracker>,
}

impl SimHooks {
    fn new(config: &SimConfig) -> Self {
        SimHooks {
            time: AtomicU64::new(0),
            max_delay: config.max_delay,
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            log: EventLog::new(),
            completions: Mutex::new(CompletionTracker::new()),
        }
    }

    pub fn time(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }
}

impl Delivery for SimHooks {
    fn receive_time(&self) -> u64 {
        let jitter = if self.max_delay > 0 {
            lock(&self.rng).gen_range(0..self.max_delay)
        } else {
            0
        };
        self.time() + 1 + jitter
    }

    fn notify_snapshot_complete(&self, server: &ServerId, snapshot_id: SnapshotId) {
        lock(&self.completions).record(server.clone(), snapshot_id);
    }

    fn record_event(&self, server: &ServerId, event: LoggedEvent) {
        self.log.record(server, event);
    }
}

/// Run state. A fatal protocol error halts the simulator for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimStatus {
    Running,
    Halted(ProtocolError),
}

/// Deterministic engine owning every server and the shared hooks.
pub struct Simulator {
    config: SimConfig,
    hooks: Arc<SimHooks>,
    servers: BTreeMap<ServerId, Arc<Server>>,
    next_snapshot_id: SnapshotId,
    started: Vec<SnapshotId>,
    status: SimStatus,
}

impl Simulator {
    /// Create an empty simulator at time 0.
    pub fn new(config: SimConfig) -> Self {
        Simulator {
            hooks: Arc::new(SimHooks::new(&config)),
            config,
            servers: BTreeMap::new(),
            next_snapshot_id: 0,
            started: Vec::new(),
            status: SimStatus::Running,
        }
    }

    /// Build servers and links from a parsed topology.
    pub fn from_topology(topology: &Topology, config: SimConfig) -> Result<Self, SimError> {
        let mut sim = Simulator::new(config);
        for (id, tokens) in &topology.servers {
            sim.add_server(id.clone(), *tokens)?;
        }
        for (src, dest) in &topology.links {
            sim.add_link(src, dest)?;
        }
        Ok(sim)
    }

    /// Add a server holding `tokens`. Ids must be unique.
    pub fn add_server(&mut self, id: impl Into<ServerId>, tokens: u64) -> Result<Arc<Server>, SimError> {
        let id = id.into();
        if self.servers.contains_key(&id) {
            return Err(SimError::DuplicateServer(id));
        }
        let server = Arc::new(Server::new(id.clone(), tokens, self.hooks.clone()));
        self.servers.insert(id, server.clone());
        Ok(server)
    }

    /// Link `src -> dest`. Returns whether a new link was created.
    pub fn add_link(&mut self, src: &ServerId, dest: &ServerId) -> Result<bool, SimError> {
        let src = self.lookup(src)?;
        let dest = self.lookup(dest)?;
        Ok(src.add_outbound_link(&dest))
    }

    /// Look up a server by id.
    pub fn server(&self, id: &ServerId) -> Option<&Arc<Server>> {
        self.servers.get(id)
    }

    /// Servers in id order.
    pub fn servers(&self) -> Vec<Arc<Server>> {
        self.servers.values().cloned().collect()
    }

    /// Current tick.
    pub fn time(&self) -> u64 {
        self.hooks.time()
    }

    /// Events recorded so far.
    pub fn log(&self) -> &EventLog {
        &self.hooks.log
    }

    /// Running, or halted by a fatal protocol error.
    pub fn status(&self) -> &SimStatus {
        &self.status
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Snapshot ids started so far, in order.
    pub fn started_snapshots(&self) -> &[SnapshotId] {
        &self.started
    }

    /// Send `amount` tokens over the link `src -> dest`. A fatal error
    /// halts the simulator.
    pub fn send_tokens(&mut self, src: &ServerId, dest: &ServerId, amount: u64) -> Result<(), SimError> {
        self.ensure_running()?;
        let server = self.lookup(src)?;
        let result = server.send_tokens(amount, dest);
        self.check(result)
    }

    /// Trigger a new snapshot on `server`. Returns its id.
    pub fn start_snapshot(&mut self, server: &ServerId) -> Result<SnapshotId, SimError> {
        self.ensure_running()?;
        let server = self.lookup(server)?;
        let snapshot_id = self.next_snapshot_id;
        self.next_snapshot_id += 1;

        info!("t={}: {} starts snapshot {}", self.time(), server.id(), snapshot_id);
        let result = server.start_snapshot(snapshot_id);
        self.check(result)?;
        self.started.push(snapshot_id);
        Ok(snapshot_id)
    }

    /// Advance one tick and deliver whatever is due.
    pub fn tick(&mut self) {
        let now = self.hooks.time.fetch_add(1, Ordering::SeqCst) + 1;
        self.hooks.log.new_epoch(now);

        for server in self.servers.values() {
            for link in server.outbound_links() {
                let Some(event) = link.pop_due(now) else {
                    continue;
                };
                let Some(dest) = self.servers.get(&event.dest) else {
                    error!("t={}: dropping event for unknown server {}", now, event.dest);
                    continue;
                };
                self.hooks.log.record(
                    &event.dest,
                    LoggedEvent::Received {
                        src: event.src.clone(),
                        dest: event.dest.clone(),
                        message: event.message,
                    },
                );
                dest.handle_packet(&event.src, event.message);
                break;
            }
        }
    }

    /// Advance `n` ticks.
    pub fn tick_n(&mut self, n: u64) {
        for _ in 0..n {
            self.tick();
        }
    }

    /// True when no link holds an event.
    pub fn is_quiet(&self) -> bool {
        self.servers
            .values()
            .all(|s| s.outbound_links().iter().all(|l| l.is_empty()))
    }

    /// Tick until every link is empty. Returns the ticks spent.
    pub fn run_until_quiet(&mut self) -> Result<u64, SimError> {
        let mut ticks = 0;
        while !self.is_quiet() {
            if ticks >= self.config.max_ticks {
                return Err(SimError::NotQuiet { ticks });
            }
            self.tick();
            ticks += 1;
        }
        Ok(ticks)
    }

    /// True once every server has reported `snapshot_id` complete.
    pub fn is_snapshot_complete(&self, snapshot_id: SnapshotId) -> bool {
        lock(&self.hooks.completions).count(snapshot_id) == self.servers.len()
    }

    /// Servers that reported `snapshot_id` complete.
    pub fn completed_servers(&self, snapshot_id: SnapshotId) -> BTreeSet<ServerId> {
        lock(&self.hooks.completions).completed(snapshot_id)
    }

    /// Completion reports received more than once.
    pub fn duplicate_completions(&self) -> Vec<(ServerId, SnapshotId)> {
        lock(&self.hooks.completions).duplicates().to_vec()
    }

    /// Tick until `snapshot_id` completes everywhere, or fail after
    /// `max_ticks`.
    pub fn run_until_snapshot_complete(&mut self, snapshot_id: SnapshotId) -> Result<u64, SimError> {
        let mut ticks = 0;
        while !self.is_snapshot_complete(snapshot_id) {
            if ticks >= self.config.max_ticks {
                return Err(SimError::Stalled { snapshot_id, ticks });
            }
            self.tick();
            ticks += 1;
        }
        debug!("snapshot {} complete after {} ticks", snapshot_id, ticks);
        Ok(ticks)
    }

    /// Wait for every snapshot started so far.
    pub fn run_until_snapshots_complete(&mut self) -> Result<(), SimError> {
        for snapshot_id in self.started.clone() {
            self.run_until_snapshot_complete(snapshot_id)?;
        }
        Ok(())
    }

    /// Play an event script, then tick until every snapshot it started
    /// has completed.
    pub fn run_script(&mut self, script: &Script) -> Result<(), SimError> {
        for event in &script.events {
            match event {
                ScriptEvent::Send { src, dest, amount } => self.send_tokens(src, dest, *amount)?,
                ScriptEvent::Snapshot { server } => {
                    self.start_snapshot(server)?;
                }
                ScriptEvent::Tick(n) => self.tick_n(*n),
            }
        }
        self.run_until_snapshots_complete()
    }

    /// Balances plus every token still queued on a link.
    pub fn total_tokens(&self) -> u64 {
        self.servers
            .values()
            .map(|s| s.tokens().saturating_add(s.queued_tokens()))
            .fold(0, u64::saturating_add)
    }

    fn lookup(&self, id: &ServerId) -> Result<Arc<Server>, SimError> {
        self.servers
            .get(id)
            .cloned()
            .ok_or_else(|| SimError::UnknownServer(id.clone()))
    }

    fn ensure_running(&self) -> Result<(), SimError> {
        match &self.status {
            SimStatus::Running => Ok(()),
            SimStatus::Halted(err) => Err(SimError::Halted(err.clone())),
        }
    }

    fn check(&mut self, result: Result<(), ProtocolError>) -> Result<(), SimError> {
        if let Err(err) = &result {
            if err.is_fatal() {
                error!("t={}: halting: {}", self.time(), err);
                self.status = SimStatus::Halted(err.clone());
            }
        }
        result.map_err(SimError::from)
    }
}
