//! Remote flash logging.
//!
//! The board appends an entry to flash every time a logged event fires.
//! This module keeps the host's view of which events are being logged
//! and runs chunked downloads of the buffered entries (see [`download`]).

pub mod download;

pub use download::{LogDownload, LogReassembler};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::EventId;
use crate::register::Value;

/// One decoded log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Board tick at which the entry was written, in milliseconds.
    pub timestamp_ms: u64,
    pub value: Value,
}

/// Receives the answer of an `is_logging` query.
pub type LoggingQuery = Box<dyn FnOnce(Result<bool>)>;

/// Receives the entries of a finished download.
pub type LogHandler = Box<dyn FnOnce(Result<Vec<LogEntry>>)>;

/// Receives download progress as a fraction in `[0.0, 1.0]`.
pub type ProgressHandler = Box<dyn FnMut(f32)>;

/// Board-confirmed logging state per event, plus queries waiting on a
/// round trip.
#[derive(Default)]
pub struct LoggingTable {
    known: HashMap<EventId, bool>,
    waiting: HashMap<EventId, Vec<LoggingQuery>>,
}

impl LoggingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, event: EventId) -> Option<bool> {
        self.known.get(&event).copied()
    }

    pub fn set(&mut self, event: EventId, logging: bool) {
        self.known.insert(event, logging);
    }

    /// Drop cached state so the next query asks the board again.
    pub fn forget(&mut self, event: EventId) {
        self.known.remove(&event);
    }

    /// Park `query` until the board answers.  Returns `true` when no
    /// request for `event` is in flight yet and one must be sent.
    pub fn wait(&mut self, event: EventId, query: LoggingQuery) -> bool {
        let queue = self.waiting.entry(event).or_default();
        queue.push(query);
        queue.len() == 1
    }

    /// Answer every query parked on `event`; successful answers are
    /// cached.
    pub fn resolve(&mut self, event: EventId, answer: Result<bool>) {
        if let Ok(logging) = answer {
            self.known.insert(event, logging);
        }
        for query in self.waiting.remove(&event).unwrap_or_default() {
            query(answer.clone());
        }
    }

    /// Fail every parked query with `err`.
    pub fn fail_all(&mut self, err: Error) {
        for (_, queue) in self.waiting.drain() {
            for query in queue {
                query(Err(err.clone()));
            }
        }
    }

    pub fn remove(&mut self, event: EventId) {
        self.known.remove(&event);
        self.waiting.remove(&event);
    }
}
