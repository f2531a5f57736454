//! Threaded cluster.
//!
//! Runs the same [`Server`] type under real concurrency. Each link gets
//! its own worker thread that drains the link in FIFO order into the
//! destination's `handle_packet`, so deliveries arriving at one server from
//! different inbound links overlap in time. Receive times are wall-clock
//! microseconds since the cluster was created plus random latency.
//!
//! Completion reports travel over a crossbeam channel to whoever is
//! waiting in [`Cluster::wait_for_snapshot`]. A fatal protocol error stops
//! every worker and halts the cluster for good.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::protocol::{Delivery, Link, LoggedEvent, ProtocolError, Server, ServerId, SnapshotId};
use crate::sync::lock;

use super::completion::CompletionTracker;
use super::config::ClusterConfig;
use super::error::SimError;
use super::logger::EventLog;
use super::simulator::SimStatus;

/// The cluster's side of the [`Delivery`] seam.
struct ClusterHooks {
    epoch: Instant,
    latency_range: (Duration, Duration),
    rng: Mutex<StdRng>,
    log: EventLog,
    /// Events queued or being handled. Incremented when a server asks for
    /// a receive time (just before it pushes), decremented after the
    /// destination has finished handling the event.
    outstanding: AtomicUsize,
    completion_tx: Sender<(ServerId, SnapshotId)>,
}

impl ClusterHooks {
    fn now(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn latency(&self) -> Duration {
        let (min, max) = self.latency_range;
        if max <= min {
            return min;
        }
        let min_us = min.as_micros() as u64;
        let max_us = max.as_micros() as u64;
        Duration::from_micros(lock(&self.rng).gen_range(min_us..=max_us))
    }
}

impl Delivery for ClusterHooks {
    fn receive_time(&self) -> u64 {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.now() + self.latency().as_micros() as u64
    }

    fn notify_snapshot_complete(&self, server: &ServerId, snapshot_id: SnapshotId) {
        let _ = self.completion_tx.send((server.clone(), snapshot_id));
    }

    fn record_event(&self, server: &ServerId, event: LoggedEvent) {
        self.log.record(server, event);
    }
}

/// Threaded engine: the same servers, one delivery thread per link.
pub struct Cluster {
    config: ClusterConfig,
    hooks: Arc<ClusterHooks>,
    completion_rx: Receiver<(ServerId, SnapshotId)>,
    completions: CompletionTracker,
    servers: BTreeMap<ServerId, Arc<Server>>,
    next_snapshot_id: SnapshotId,
    status: SimStatus,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (completion_tx, completion_rx) = unbounded();
        let hooks = Arc::new(ClusterHooks {
            epoch: Instant::now(),
            latency_range: config.latency_range,
            rng: Mutex::new(rng),
            log: EventLog::new(),
            outstanding: AtomicUsize::new(0),
            completion_tx,
        });

        Cluster {
            config,
            hooks,
            completion_rx,
            completions: CompletionTracker::new(),
            servers: BTreeMap::new(),
            next_snapshot_id: 0,
            status: SimStatus::Running,
            running: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        }
    }

    pub fn add_server(&mut self, id: impl Into<ServerId>, tokens: u64) -> Result<Arc<Server>, SimError> {
        self.ensure_not_started()?;
        let id = id.into();
        if self.servers.contains_key(&id) {
            return Err(SimError::DuplicateServer(id));
        }
        let server = Arc::new(Server::new(id.clone(), tokens, self.hooks.clone()));
        self.servers.insert(id, server.clone());
        Ok(server)
    }

    pub fn add_link(&mut self, src: &ServerId, dest: &ServerId) -> Result<bool, SimError> {
        self.ensure_not_started()?;
        let src = self.lookup(src)?;
        let dest = self.lookup(dest)?;
        Ok(src.add_outbound_link(&dest))
    }

    /// Spawn one delivery worker per link. The topology is frozen from
    /// here on. A halted cluster does not restart.
    pub fn start(&mut self) {
        if self.status != SimStatus::Running || self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        for server in self.servers.values() {
            for link in server.outbound_links() {
                let Some(dest) = self.servers.get(link.dest()).cloned() else {
                    continue;
                };
                let worker = LinkWorker {
                    link,
                    dest,
                    hooks: self.hooks.clone(),
                    running: self.running.clone(),
                    poll_interval: self.config.poll_interval,
                };
                self.workers.push(thread::spawn(move || worker.run()));
            }
        }
        info!("cluster started with {} link workers", self.workers.len());
    }

    /// Whether link workers are delivering.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Running, or halted by a fatal protocol error.
    pub fn status(&self) -> &SimStatus {
        &self.status
    }

    pub fn server(&self, id: &ServerId) -> Option<&Arc<Server>> {
        self.servers.get(id)
    }

    pub fn servers(&self) -> Vec<Arc<Server>> {
        self.servers.values().cloned().collect()
    }

    pub fn log(&self) -> &EventLog {
        &self.hooks.log
    }

    /// Send `amount` tokens over the link `src -> dest`. A fatal error
    /// halts the cluster.
    pub fn send_tokens(&mut self, src: &ServerId, dest: &ServerId, amount: u64) -> Result<(), SimError> {
        self.ensure_running()?;
        let result = self.lookup(src)?.send_tokens(amount, dest);
        self.check(result)
    }

    /// Trigger a new snapshot on `server`. Returns its id.
    pub fn start_snapshot(&mut self, server: &ServerId) -> Result<SnapshotId, SimError> {
        self.ensure_running()?;
        let server = self.lookup(server)?;
        let snapshot_id = self.next_snapshot_id;
        self.next_snapshot_id += 1;
        let result = server.start_snapshot(snapshot_id);
        self.check(result)?;
        Ok(snapshot_id)
    }

    /// Block until every server reports `snapshot_id` complete or the
    /// timeout passes. Returns whether it completed.
    pub fn wait_for_snapshot(&mut self, snapshot_id: SnapshotId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.drain_completions();
            if self.is_snapshot_complete(snapshot_id) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.completion_rx.recv_timeout(remaining) {
                Ok((server, id)) => {
                    self.completions.record(server, id);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    self.drain_completions();
                    return self.is_snapshot_complete(snapshot_id);
                }
            }
        }
    }

    /// Block until no event is queued or being handled, or the timeout
    /// passes. Returns whether the cluster went quiet.
    pub fn wait_until_quiet(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.hooks.outstanding.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(self.config.poll_interval);
        }
        true
    }

    pub fn is_snapshot_complete(&self, snapshot_id: SnapshotId) -> bool {
        self.completions.count(snapshot_id) == self.servers.len()
    }

    pub fn completed_servers(&mut self, snapshot_id: SnapshotId) -> BTreeSet<ServerId> {
        self.drain_completions();
        self.completions.completed(snapshot_id)
    }

    pub fn duplicate_completions(&mut self) -> Vec<(ServerId, SnapshotId)> {
        self.drain_completions();
        self.completions.duplicates().to_vec()
    }

    /// Balances plus every token still queued on a link.
    pub fn total_tokens(&self) -> u64 {
        self.servers
            .values()
            .map(|s| s.tokens().saturating_add(s.queued_tokens()))
            .fold(0, u64::saturating_add)
    }

    /// Stop and join every link worker. Queued events stay on their links.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    fn drain_completions(&mut self) {
        while let Ok((server, snapshot_id)) = self.completion_rx.try_recv() {
            self.completions.record(server, snapshot_id);
        }
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
                error!("halting cluster: {}", err);
                self.status = SimStatus::Halted(err.clone());
                self.stop();
            }
        }
        result.map_err(SimError::from)
    }

    fn ensure_not_started(&self) -> Result<(), SimError> {
        self.ensure_running()?;
        if self.is_running() {
            return Err(SimError::AlreadyStarted);
        }
        Ok(())
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drains one link into its destination.
struct LinkWorker {
    link: Arc<Link>,
    dest: Arc<Server>,
    hooks: Arc<ClusterHooks>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl LinkWorker {
    fn run(self) {
        debug!("worker for {} -> {} started", self.link.src(), self.link.dest());
        while self.running.load(Ordering::SeqCst) {
            let Some(event) = self.link.pop_due(self.hooks.now()) else {
                thread::sleep(self.poll_interval);
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
            self.dest.handle_packet(&event.src, event.message);
            self.hooks.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
        debug!("worker for {} -> {} stopped", self.link.src(), self.link.dest());
    }
}
