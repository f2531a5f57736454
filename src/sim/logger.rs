//! Diagnostic event log.
//!
//! Events are grouped into epochs, one per simulator tick that recorded
//! something (the threaded cluster keeps everything in epoch 0). Every record is also forwarded to
//! the `log` facade at debug level.

use std::fmt::Write as _;
use std::sync::Mutex;

use log::debug;
use serde::Serialize;

use crate::protocol::{LoggedEvent, ServerId};
use crate::sync::lock;

/// Events recorded during one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Epoch {
    pub time: u64,
    pub events: Vec<(ServerId, LoggedEvent)>,
}

#[derive(Debug)]
pub struct EventLog {
    epochs: Mutex<Vec<Epoch>>,
}

impl EventLog {
    pub fn new() -> Self {
        EventLog {
            epochs: Mutex::new(vec![Epoch {
                time: 0,
                events: Vec::new(),
            }]),
        }
    }

    /// Start collecting events for `time`. A trailing epoch that recorded
    /// nothing is reused, so quiet ticks do not grow the log.
    pub fn new_epoch(&self, time: u64) {
        let mut epochs = lock(&self.epochs);
        match epochs.last_mut() {
            Some(last) if last.events.is_empty() => last.time = time,
            _ => epochs.push(Epoch {
                time,
                events: Vec::new(),
            }),
        }
    }

    pub fn record(&self, server: &ServerId, event: LoggedEvent) {
        let mut epochs = lock(&self.epochs);
        // The constructor seeds one epoch and nothing removes them.
        if let Some(epoch) = epochs.last_mut() {
            debug!("[t={}] {}", epoch.time, event);
            epoch.events.push((server.clone(), event));
        }
    }

    pub fn epochs(&self) -> Vec<Epoch> {
        lock(&self.epochs).clone()
    }

    /// Every event, oldest first.
    pub fn events(&self) -> Vec<LoggedEvent> {
        lock(&self.epochs)
            .iter()
            .flat_map(|epoch| epoch.events.iter().map(|(_, event)| event.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.epochs).iter().map(|e| e.events.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable dump, skipping quiet epochs.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for epoch in lock(&self.epochs).iter().filter(|e| !e.events.is_empty()) {
            let _ = writeln!(out, "Time {}:", epoch.time);
            for (_, event) in &epoch.events {
                let _ = writeln!(out, "  {}", event);
            }
        }
        out
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
