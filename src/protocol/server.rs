//! Snapshot protocol participant.
//!
//! A server holds a token balance and exchanges two kinds of messages with
//! its neighbors: token transfers and snapshot markers. The protocol rules
//! live in [`Server::handle_packet`] and [`Server::start_snapshot`].
//!
//! # Invariants
//!
//! 1. **Single balance lock**: every read-modify-write of `tokens` happens
//!    under the server's `tokens` mutex, including the capture performed by
//!    a snapshot trigger.
//! 2. **Capture before markers**: a trigger captures the balance, installs
//!    the record and enqueues its markers without releasing that mutex, so
//!    every transfer this server sends lands on each link either wholly
//!    before or wholly after the marker.
//! 3. **Atomic receive**: a received transfer is credited and recorded into
//!    open snapshots under the same mutex, so a concurrent trigger from
//!    another link sees it either in the balance or in channel state, never
//!    both.
//! 4. **Exactly-once completion**: a record reports completion only on its
//!    `Open -> Complete` transition.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, error, trace, warn};

use super::delivery::Delivery;
use super::error::ProtocolError;
use super::link::Link;
use super::message::{InFlightMessage, LoggedEvent, Message, SendMessageEvent, ServerId, SnapshotId};
use super::snapshot::{SharedRecord, SnapshotRecord, SnapshotState, SnapshotStatus, SnapshotTable};
use crate::sync::{lock, read, write};

/// One participant: a token balance, its links and its snapshot records.
pub struct Server {
    id: ServerId,
    tokens: Mutex<u64>,
    delivery: Arc<dyn Delivery>,
    /// Keyed by destination.
    outbound_links: RwLock<BTreeMap<ServerId, Arc<Link>>>,
    /// Keyed by source. The key set is the marker quorum for every snapshot.
    inbound_links: RwLock<BTreeMap<ServerId, Arc<Link>>>,
    snapshots: SnapshotTable,
}

impl Server {
    /// Create a server holding `tokens`, with no links.
    ///
    /// Initial balances across one topology must sum to at most
    /// `u64::MAX`. Conservation keeps every balance under that bound.
    pub fn new(id: impl Into<ServerId>, tokens: u64, delivery: Arc<dyn Delivery>) -> Self {
        Server {
            id: id.into(),
            tokens: Mutex::new(tokens),
            delivery,
            outbound_links: RwLock::new(BTreeMap::new()),
            inbound_links: RwLock::new(BTreeMap::new()),
            snapshots: SnapshotTable::new(),
        }
    }

    /// Stable identifier.
    pub fn id(&self) -> &ServerId {
        &self.id
    }

    /// Current balance.
    pub fn tokens(&self) -> u64 {
        *lock(&self.tokens)
    }

    /// Add a unidirectional link from this server to `dest`.
    ///
    /// Also registers the link as inbound on `dest`. Linking a server to
    /// itself, or registering an existing pair again, changes nothing.
    /// Returns whether a new link was created.
    ///
    /// The topology must be complete before traffic starts: the inbound set
    /// at the time a marker arrives decides when a snapshot completes.
    pub fn add_outbound_link(&self, dest: &Server) -> bool {
        if self.id == dest.id {
            debug!("{}: ignoring self link", self.id);
            return false;
        }

        let mut outbound = write(&self.outbound_links);
        if outbound.contains_key(&dest.id) {
            return false;
        }

        let link = Arc::new(Link::new(self.id.clone(), dest.id.clone()));
        outbound.insert(dest.id.clone(), link.clone());
        write(&dest.inbound_links).insert(self.id.clone(), link);
        debug!("{}: added link to {}", self.id, dest.id);
        true
    }

    /// Enqueue `message` on every outbound link, in destination order.
    pub fn send_to_neighbors(&self, message: Message) {
        let _tokens = lock(&self.tokens);
        self.broadcast(message);
    }

    /// Send `amount` tokens to the outbound neighbor `dest`.
    ///
    /// The balance is debited before the transfer is queued. Both failure
    /// cases are fatal and leave the balance and every link untouched.
    pub fn send_tokens(&self, amount: u64, dest: &ServerId) -> Result<(), ProtocolError> {
        let mut tokens = lock(&self.tokens);
        if *tokens < amount {
            return Err(self.fatal(ProtocolError::InsufficientTokens {
                server: self.id.clone(),
                requested: amount,
                available: *tokens,
            }));
        }

        let link = read(&self.outbound_links).get(dest).cloned().ok_or_else(|| {
            self.fatal(ProtocolError::UnknownDestination {
                server: self.id.clone(),
                dest: dest.clone(),
            })
        })?;

        *tokens -= amount;
        self.enqueue(&link, Message::Token { amount });
        Ok(())
    }

    /// Handle a message delivered on the inbound link from `src`.
    pub fn handle_packet(&self, src: &ServerId, message: Message) {
        trace!("{}: received {} from {}", self.id, message, src);
        match message {
            Message::Token { amount } => self.receive_tokens(src, amount),
            Message::Marker { snapshot_id } => self.receive_marker(src, snapshot_id),
        }
    }

    /// Trigger snapshot `snapshot_id` locally: capture the balance and send
    /// markers to every neighbor.
    ///
    /// A second trigger for the same id is rejected and the existing record
    /// is kept.
    pub fn start_snapshot(&self, snapshot_id: SnapshotId) -> Result<(), ProtocolError> {
        let completed = {
            let tokens = lock(&self.tokens);
            if self.snapshots.contains(snapshot_id) {
                return Err(ProtocolError::DuplicateSnapshot {
                    server: self.id.clone(),
                    snapshot_id,
                });
            }
            self.begin_snapshot(*tokens, snapshot_id).1
        };

        if completed {
            self.report_complete(snapshot_id);
        }
        Ok(())
    }

    /// Copy of the captured state for `snapshot_id`.
    pub fn snapshot(&self, snapshot_id: SnapshotId) -> Option<SnapshotState> {
        self.snapshots.record(snapshot_id).map(|r| r.state().clone())
    }

    /// Copy of the full record, including markers seen so far.
    pub fn snapshot_record(&self, snapshot_id: SnapshotId) -> Option<SnapshotRecord> {
        self.snapshots.record(snapshot_id)
    }

    /// Lifecycle of `snapshot_id` here, `None` while absent.
    pub fn snapshot_status(&self, snapshot_id: SnapshotId) -> Option<SnapshotStatus> {
        self.snapshots.record(snapshot_id).map(|r| r.status())
    }

    /// Ids of every snapshot this server has a record for.
    pub fn snapshot_ids(&self) -> Vec<SnapshotId> {
        self.snapshots.ids()
    }

    /// The link to `dest`, if one exists.
    pub fn outbound_link(&self, dest: &ServerId) -> Option<Arc<Link>> {
        read(&self.outbound_links).get(dest).cloned()
    }

    /// Outbound links in destination order.
    pub fn outbound_links(&self) -> Vec<Arc<Link>> {
        read(&self.outbound_links).values().cloned().collect()
    }

    /// Sum of token transfers queued on this server's outbound links.
    pub fn queued_tokens(&self) -> u64 {
        read(&self.outbound_links)
            .values()
            .map(|l| l.in_flight_tokens())
            .fold(0, u64::saturating_add)
    }

    /// Sources of every inbound link, in order.
    pub fn inbound_neighbors(&self) -> Vec<ServerId> {
        read(&self.inbound_links).keys().cloned().collect()
    }

    fn receive_tokens(&self, src: &ServerId, amount: u64) {
        let mut tokens = lock(&self.tokens);
        *tokens = tokens.saturating_add(amount);

        let received = InFlightMessage {
            src: src.clone(),
            dest: self.id.clone(),
            message: Message::Token { amount },
        };
        self.snapshots.for_each(|record| {
            if record.record_in_flight(&received) {
                trace!(
                    "{}: snapshot {} recorded {} from {}",
                    self.id,
                    record.snapshot_id(),
                    received.message,
                    src
                );
            }
        });
    }

    fn receive_marker(&self, src: &ServerId, snapshot_id: SnapshotId) {
        let quorum = {
            let inbound = read(&self.inbound_links);
            if !inbound.contains_key(src) {
                warn!(
                    "{}: ignoring marker({}) from {}, not an inbound neighbor",
                    self.id, snapshot_id, src
                );
                return;
            }
            inbound.len()
        };

        // First marker for this id: capture local state before anything else.
        let record = {
            let tokens = lock(&self.tokens);
            match self.snapshots.get(snapshot_id) {
                Some(record) => record,
                None => self.begin_snapshot(*tokens, snapshot_id).0,
            }
        };

        let completed = lock(&record).record_marker(src.clone(), quorum);
        if completed {
            self.report_complete(snapshot_id);
        }
    }

    /// Install a new record and broadcast its markers.
    ///
    /// Must be called with the `tokens` mutex held; `tokens` is the balance
    /// read under it. Returns the record and whether it completed on the
    /// spot, which happens only when there are no inbound links.
    fn begin_snapshot(&self, tokens: u64, snapshot_id: SnapshotId) -> (SharedRecord, bool) {
        let mut record = SnapshotRecord::new(snapshot_id, self.id.clone(), tokens);
        let completed = record.complete_if_covered(read(&self.inbound_links).len());

        let record = match self.snapshots.insert_if_absent(record) {
            Ok(record) => record,
            Err(existing) => return (existing, false),
        };

        debug!("{}: started snapshot {} with {} tokens", self.id, snapshot_id, tokens);
        self.delivery.record_event(
            &self.id,
            LoggedEvent::SnapshotStarted {
                server: self.id.clone(),
                snapshot_id,
            },
        );
        self.broadcast(Message::Marker { snapshot_id });
        (record, completed)
    }

    fn broadcast(&self, message: Message) {
        for link in read(&self.outbound_links).values() {
            self.enqueue(link, message);
        }
    }

    fn enqueue(&self, link: &Link, message: Message) {
        self.delivery.record_event(
            &self.id,
            LoggedEvent::Sent {
                src: self.id.clone(),
                dest: link.dest().clone(),
                message,
            },
        );
        let receive_time = self.delivery.receive_time();
        trace!("{}: queued {} for {} at {}", self.id, message, link.dest(), receive_time);
        link.push(SendMessageEvent {
            src: self.id.clone(),
            dest: link.dest().clone(),
            message,
            receive_time,
        });
    }

    fn report_complete(&self, snapshot_id: SnapshotId) {
        debug!("{}: snapshot {} complete", self.id, snapshot_id);
        self.delivery.record_event(
            &self.id,
            LoggedEvent::SnapshotCompleted {
                server: self.id.clone(),
                snapshot_id,
            },
        );
        self.delivery.notify_snapshot_complete(&self.id, snapshot_id);
    }

    fn fatal(&self, err: ProtocolError) -> ProtocolError {
        error!("{}", err);
        err
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("tokens", &self.tokens())
            .field("outbound", &read(&self.outbound_links).keys().collect::<Vec<_>>())
            .field("inbound", &read(&self.inbound_links).keys().collect::<Vec<_>>())
            .field("snapshots", &self.snapshots.ids())
            .finish()
    }
}
